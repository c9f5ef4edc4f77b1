//! Hardware Abstraction Layer
//!
//! The renderer never touches native graphics handles. Everything it needs
//! from the GPU goes through [`RenderBackend`]: resource creation and
//! destruction, render-pass begin/end, binding and draw submission.
//!
//! Two implementations ship with the crate:
//!
//! | Backend | Feature | Use |
//! |---------|---------|-----|
//! | [`HeadlessBackend`] | always | tests, tooling, CPU-only validation |
//! | `WgpuBackend` | `wgpu-backend` | native GPU via wgpu |
//!
//! Descriptors reuse wgpu's plain enums (formats, usages, blend states) so
//! pipeline state keys hash the same values a wgpu device would consume.

pub mod headless;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

use std::ops::Range;

use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::errors::Result;

pub use headless::{BackendCommand, HeadlessBackend};
#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::WgpuBackend;

new_key_type! {
    pub struct BufferId;
    pub struct TextureId;
    pub struct ShaderModuleId;
    pub struct PipelineId;
    pub struct BindGroupId;
}

// ─── Capabilities ────────────────────────────────────────────────────────────

/// What the active backend can do. Queried before optional features are
/// used; a missing capability selects a fallback path, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub max_texture_size: u32,
    pub max_texture_array_layers: u32,
    pub max_color_attachments: u32,
    pub storage_buffers: bool,
    pub float_render_targets: bool,
    pub cube_render_targets: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            max_texture_size: 8192,
            max_texture_array_layers: 256,
            max_color_attachments: 8,
            storage_buffers: true,
            float_render_targets: true,
            cube_render_targets: true,
        }
    }
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    /// Array layers; 6 for cube maps.
    pub layers: u32,
    pub mip_level_count: u32,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
    pub cube: bool,
}

impl TextureDesc {
    /// A single-layer, single-mip 2D texture.
    #[must_use]
    pub fn d2(
        label: &'static str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        Self {
            label,
            width,
            height,
            layers: 1,
            mip_level_count: 1,
            format,
            usage,
            cube: false,
        }
    }
}

/// One vertex attribute inside an interleaved buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeDesc {
    pub format: wgpu::VertexFormat,
    pub offset: u64,
    pub location: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexLayoutDesc {
    pub stride: u64,
    pub attributes: SmallVec<[VertexAttributeDesc; 8]>,
}

#[derive(Debug, Clone)]
pub struct RenderPipelineDesc<'a> {
    pub label: &'a str,
    pub module: ShaderModuleId,
    pub vertex_entry: &'a str,
    pub fragment_entry: Option<&'a str>,
    /// Empty for fullscreen passes that synthesize vertices.
    pub vertex_layout: Option<&'a VertexLayoutDesc>,
    pub topology: wgpu::PrimitiveTopology,
    pub cull_mode: Option<wgpu::Face>,
    pub color_formats: &'a [wgpu::TextureFormat],
    pub blend: Option<wgpu::BlendState>,
    pub depth_format: Option<wgpu::TextureFormat>,
    pub depth_write: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub sample_count: u32,
}

/// A resource bound at one binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingResource {
    Buffer { buffer: BufferId, offset: u64, size: Option<u64> },
    Texture(TextureId),
    /// Sampler built from a texture's filtering state.
    Sampler { filter: wgpu::FilterMode, address: wgpu::AddressMode },
}

#[derive(Debug, Clone)]
pub struct BindGroupDesc<'a> {
    pub label: &'a str,
    /// Bind groups are created against a pipeline's layout at `group`.
    pub pipeline: PipelineId,
    pub group: u32,
    pub entries: &'a [(u32, BindingResource)],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub texture: TextureId,
    /// Array layer (cube face) to render into.
    pub layer: u32,
    /// `None` loads existing contents.
    pub clear: Option<wgpu::Color>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub texture: TextureId,
    pub layer: u32,
    pub clear: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDesc {
    pub label: &'static str,
    pub color_attachments: SmallVec<[ColorAttachment; 2]>,
    pub depth_attachment: Option<DepthAttachment>,
}

impl RenderPassDesc {
    /// One color target, optionally with depth.
    #[must_use]
    pub fn single(
        label: &'static str,
        color: TextureId,
        clear: Option<wgpu::Color>,
        depth: Option<TextureId>,
    ) -> Self {
        Self {
            label,
            color_attachments: smallvec::smallvec![ColorAttachment {
                texture: color,
                layer: 0,
                clear,
            }],
            depth_attachment: depth.map(|texture| DepthAttachment {
                texture,
                layer: 0,
                clear: Some(1.0),
            }),
        }
    }
}

// ─── Backend Trait ───────────────────────────────────────────────────────────

/// Abstract GPU command and resource interface.
///
/// All methods must be called from the thread that owns the backend; the
/// renderer performs no internal locking.
///
/// Pass recording follows a strict protocol: `begin_render_pass` opens a pass,
/// binding and draw calls are only valid inside it, `end_render_pass` closes
/// it. Resource creation is valid at any time outside a pass.
pub trait RenderBackend {
    fn name(&self) -> &'static str;

    /// Concrete backend access, e.g. the headless command log in tests.
    fn as_any(&self) -> &dyn std::any::Any;

    fn capabilities(&self) -> &BackendCapabilities;

    // === Buffers ===
    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId>;
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    // === Textures ===
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId>;
    /// Uploads tightly packed texel data for one mip level of layer 0.
    fn write_texture(&mut self, texture: TextureId, mip_level: u32, data: &[u8]) -> Result<()>;
    fn destroy_texture(&mut self, texture: TextureId);
    fn texture_desc(&self, texture: TextureId) -> Option<&TextureDesc>;

    // === Shaders & Pipelines ===
    fn create_shader_module(&mut self, label: &str, wgsl: &str) -> Result<ShaderModuleId>;
    fn destroy_shader_module(&mut self, module: ShaderModuleId);
    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc<'_>) -> Result<PipelineId>;
    fn destroy_render_pipeline(&mut self, pipeline: PipelineId);

    // === Bind Groups ===
    fn create_bind_group(&mut self, desc: &BindGroupDesc<'_>) -> Result<BindGroupId>;
    fn destroy_bind_group(&mut self, group: BindGroupId);

    // === Pass Recording ===
    fn begin_render_pass(&mut self, desc: &RenderPassDesc) -> Result<()>;
    fn end_render_pass(&mut self) -> Result<()>;
    fn is_in_render_pass(&self) -> bool;

    fn set_pipeline(&mut self, pipeline: PipelineId) -> Result<()>;
    fn set_bind_group(&mut self, index: u32, group: BindGroupId, offsets: &[u32]) -> Result<()>;
    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferId) -> Result<()>;
    fn set_index_buffer(&mut self, buffer: BufferId, format: wgpu::IndexFormat) -> Result<()>;
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) -> Result<()>;
    fn draw_indexed(
        &mut self,
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    ) -> Result<()>;

    /// Flushes recorded work to the device.
    fn submit(&mut self) -> Result<()>;
}
