//! Headless Recording Backend
//!
//! A [`RenderBackend`] that owns no GPU. Every call is validated the way a
//! real device would validate it and then appended to a command log, which
//! tests inspect to check draw order, pass structure and resource lifetime.

use std::ops::Range;

use slotmap::SlotMap;

use super::{
    BackendCapabilities, BindGroupDesc, BindGroupId, BufferDesc, BufferId, PipelineId,
    RenderBackend, RenderPassDesc, RenderPipelineDesc, ShaderModuleId, TextureDesc, TextureId,
};
use crate::errors::{LumenError, Result};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    CreateBuffer { id: BufferId, label: &'static str, size: u64 },
    WriteBuffer { id: BufferId, offset: u64, len: usize },
    DestroyBuffer(BufferId),
    CreateTexture { id: TextureId, desc: TextureDesc },
    WriteTexture { id: TextureId, mip_level: u32, len: usize },
    DestroyTexture(TextureId),
    CreateShaderModule { id: ShaderModuleId, label: String },
    DestroyShaderModule(ShaderModuleId),
    CreatePipeline { id: PipelineId, label: String },
    DestroyPipeline(PipelineId),
    CreateBindGroup { id: BindGroupId },
    DestroyBindGroup(BindGroupId),
    BeginPass { label: &'static str, desc: RenderPassDesc },
    EndPass,
    SetPipeline(PipelineId),
    SetBindGroup { index: u32, group: BindGroupId },
    SetVertexBuffer { slot: u32, buffer: BufferId },
    SetIndexBuffer(BufferId),
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, instances: Range<u32> },
    Submit,
}

struct HeadlessBuffer {
    size: u64,
    data: Vec<u8>,
}

struct HeadlessTexture {
    desc: TextureDesc,
    uploaded_mips: u32,
}

/// Recording backend used by tests and CPU-only tooling.
pub struct HeadlessBackend {
    caps: BackendCapabilities,

    buffers: SlotMap<BufferId, HeadlessBuffer>,
    textures: SlotMap<TextureId, HeadlessTexture>,
    modules: SlotMap<ShaderModuleId, String>,
    pipelines: SlotMap<PipelineId, String>,
    bind_groups: SlotMap<BindGroupId, PipelineId>,

    commands: Vec<BackendCommand>,
    in_pass: bool,
    pass_has_pipeline: bool,
    submits: u32,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(BackendCapabilities::default())
    }

    #[must_use]
    pub fn with_capabilities(caps: BackendCapabilities) -> Self {
        Self {
            caps,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            modules: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            bind_groups: SlotMap::with_key(),
            commands: Vec::with_capacity(256),
            in_pass: false,
            pass_has_pipeline: false,
            submits: 0,
        }
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn commands(&self) -> &[BackendCommand] {
        &self.commands
    }

    /// Drops the recorded log, keeping live resources.
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    #[must_use]
    pub fn live_shader_modules(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn buffer_contents(&self, id: BufferId) -> Option<&[u8]> {
        self.buffers.get(id).map(|b| b.data.as_slice())
    }

    #[must_use]
    pub fn texture_exists(&self, id: TextureId) -> bool {
        self.textures.contains_key(id)
    }

    #[must_use]
    pub fn uploaded_mips(&self, id: TextureId) -> u32 {
        self.textures.get(id).map_or(0, |t| t.uploaded_mips)
    }

    #[must_use]
    pub fn submit_count(&self) -> u32 {
        self.submits
    }

    /// Number of recorded draw calls (indexed and non-indexed).
    #[must_use]
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, BackendCommand::Draw { .. } | BackendCommand::DrawIndexed { .. }))
            .count()
    }

    #[must_use]
    pub fn pipeline_label(&self, id: PipelineId) -> Option<&str> {
        self.pipelines.get(id).map(String::as_str)
    }

    // ── Validation helpers ─────────────────────────────────────────────────

    fn require_pass(&self, call: &str) -> Result<()> {
        if self.in_pass {
            Ok(())
        } else {
            log::error!("{call} outside of a render pass");
            Err(LumenError::ContractViolation(format!(
                "{call} called outside of a render pass"
            )))
        }
    }

    fn require_no_pass(&self, call: &str) -> Result<()> {
        if self.in_pass {
            log::error!("{call} inside an active render pass");
            Err(LumenError::ContractViolation(format!(
                "{call} called inside an active render pass"
            )))
        } else {
            Ok(())
        }
    }
}

impl RenderBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.caps
    }

    // === Buffers ===

    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId> {
        let mut data = vec![0u8; desc.size as usize];
        if let Some(contents) = contents {
            let len = contents.len().min(data.len());
            data[..len].copy_from_slice(&contents[..len]);
        }
        let id = self.buffers.insert(HeadlessBuffer {
            size: desc.size,
            data,
        });
        self.commands.push(BackendCommand::CreateBuffer {
            id,
            label: desc.label,
            size: desc.size,
        });
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let entry = self
            .buffers
            .get_mut(buffer)
            .ok_or(LumenError::InvalidHandle { kind: "buffer" })?;
        let end = offset + data.len() as u64;
        if end > entry.size {
            return Err(LumenError::Backend(format!(
                "buffer write out of bounds: {end} > {}",
                entry.size
            )));
        }
        entry.data[offset as usize..end as usize].copy_from_slice(data);
        self.commands.push(BackendCommand::WriteBuffer {
            id: buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(buffer).is_some() {
            self.commands.push(BackendCommand::DestroyBuffer(buffer));
        }
    }

    // === Textures ===

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        let max = self.caps.max_texture_size;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(LumenError::Backend(format!(
                "texture '{}' size {}x{} outside 1..={max}",
                desc.label, desc.width, desc.height
            )));
        }
        if desc.cube && !self.caps.cube_render_targets {
            return Err(LumenError::UnsupportedFeature("cube render targets"));
        }
        let id = self.textures.insert(HeadlessTexture {
            desc: desc.clone(),
            uploaded_mips: 0,
        });
        self.commands.push(BackendCommand::CreateTexture {
            id,
            desc: desc.clone(),
        });
        Ok(id)
    }

    fn write_texture(&mut self, texture: TextureId, mip_level: u32, data: &[u8]) -> Result<()> {
        let entry = self
            .textures
            .get_mut(texture)
            .ok_or(LumenError::InvalidHandle { kind: "texture" })?;
        if mip_level >= entry.desc.mip_level_count {
            return Err(LumenError::Backend(format!(
                "mip level {mip_level} out of range for '{}'",
                entry.desc.label
            )));
        }
        entry.uploaded_mips = entry.uploaded_mips.max(mip_level + 1);
        self.commands.push(BackendCommand::WriteTexture {
            id: texture,
            mip_level,
            len: data.len(),
        });
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.textures.remove(texture).is_some() {
            self.commands.push(BackendCommand::DestroyTexture(texture));
        }
    }

    fn texture_desc(&self, texture: TextureId) -> Option<&TextureDesc> {
        self.textures.get(texture).map(|t| &t.desc)
    }

    // === Shaders & Pipelines ===

    fn create_shader_module(&mut self, label: &str, wgsl: &str) -> Result<ShaderModuleId> {
        if wgsl.trim().is_empty() {
            return Err(LumenError::Backend(format!("empty shader source for '{label}'")));
        }
        let id = self.modules.insert(label.to_string());
        self.commands.push(BackendCommand::CreateShaderModule {
            id,
            label: label.to_string(),
        });
        Ok(id)
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleId) {
        if self.modules.remove(module).is_some() {
            self.commands.push(BackendCommand::DestroyShaderModule(module));
        }
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc<'_>) -> Result<PipelineId> {
        if !self.modules.contains_key(desc.module) {
            return Err(LumenError::InvalidHandle {
                kind: "shader module",
            });
        }
        if desc.color_formats.len() > self.caps.max_color_attachments as usize {
            return Err(LumenError::UnsupportedFeature("color attachment count"));
        }
        let id = self.pipelines.insert(desc.label.to_string());
        self.commands.push(BackendCommand::CreatePipeline {
            id,
            label: desc.label.to_string(),
        });
        Ok(id)
    }

    fn destroy_render_pipeline(&mut self, pipeline: PipelineId) {
        if self.pipelines.remove(pipeline).is_some() {
            self.bind_groups.retain(|_, owner| *owner != pipeline);
            self.commands.push(BackendCommand::DestroyPipeline(pipeline));
        }
    }

    // === Bind Groups ===

    fn create_bind_group(&mut self, desc: &BindGroupDesc<'_>) -> Result<BindGroupId> {
        if !self.pipelines.contains_key(desc.pipeline) {
            return Err(LumenError::InvalidHandle { kind: "pipeline" });
        }
        for (_, resource) in desc.entries {
            match *resource {
                super::BindingResource::Buffer { buffer, .. } => {
                    if !self.buffers.contains_key(buffer) {
                        return Err(LumenError::InvalidHandle { kind: "buffer" });
                    }
                }
                super::BindingResource::Texture(texture) => {
                    if !self.textures.contains_key(texture) {
                        return Err(LumenError::InvalidHandle { kind: "texture" });
                    }
                }
                super::BindingResource::Sampler { .. } => {}
            }
        }
        let id = self.bind_groups.insert(desc.pipeline);
        self.commands.push(BackendCommand::CreateBindGroup { id });
        Ok(id)
    }

    fn destroy_bind_group(&mut self, group: BindGroupId) {
        if self.bind_groups.remove(group).is_some() {
            self.commands.push(BackendCommand::DestroyBindGroup(group));
        }
    }

    // === Pass Recording ===

    fn begin_render_pass(&mut self, desc: &RenderPassDesc) -> Result<()> {
        self.require_no_pass("begin_render_pass")?;
        for attachment in &desc.color_attachments {
            if !self.textures.contains_key(attachment.texture) {
                return Err(LumenError::InvalidHandle { kind: "texture" });
            }
        }
        if let Some(depth) = &desc.depth_attachment
            && !self.textures.contains_key(depth.texture)
        {
            return Err(LumenError::InvalidHandle { kind: "texture" });
        }
        self.in_pass = true;
        self.pass_has_pipeline = false;
        self.commands.push(BackendCommand::BeginPass {
            label: desc.label,
            desc: desc.clone(),
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> Result<()> {
        self.require_pass("end_render_pass")?;
        self.in_pass = false;
        self.commands.push(BackendCommand::EndPass);
        Ok(())
    }

    fn is_in_render_pass(&self) -> bool {
        self.in_pass
    }

    fn set_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        self.require_pass("set_pipeline")?;
        if !self.pipelines.contains_key(pipeline) {
            return Err(LumenError::InvalidHandle { kind: "pipeline" });
        }
        self.pass_has_pipeline = true;
        self.commands.push(BackendCommand::SetPipeline(pipeline));
        Ok(())
    }

    fn set_bind_group(&mut self, index: u32, group: BindGroupId, _offsets: &[u32]) -> Result<()> {
        self.require_pass("set_bind_group")?;
        if !self.bind_groups.contains_key(group) {
            return Err(LumenError::InvalidHandle { kind: "bind group" });
        }
        self.commands
            .push(BackendCommand::SetBindGroup { index, group });
        Ok(())
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferId) -> Result<()> {
        self.require_pass("set_vertex_buffer")?;
        if !self.buffers.contains_key(buffer) {
            return Err(LumenError::InvalidHandle { kind: "buffer" });
        }
        self.commands
            .push(BackendCommand::SetVertexBuffer { slot, buffer });
        Ok(())
    }

    fn set_index_buffer(&mut self, buffer: BufferId, _format: wgpu::IndexFormat) -> Result<()> {
        self.require_pass("set_index_buffer")?;
        if !self.buffers.contains_key(buffer) {
            return Err(LumenError::InvalidHandle { kind: "buffer" });
        }
        self.commands.push(BackendCommand::SetIndexBuffer(buffer));
        Ok(())
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) -> Result<()> {
        self.require_pass("draw")?;
        if !self.pass_has_pipeline {
            return Err(LumenError::ContractViolation(
                "draw without a bound pipeline".into(),
            ));
        }
        self.commands.push(BackendCommand::Draw {
            vertices,
            instances,
        });
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        indices: Range<u32>,
        _base_vertex: i32,
        instances: Range<u32>,
    ) -> Result<()> {
        self.require_pass("draw_indexed")?;
        if !self.pass_has_pipeline {
            return Err(LumenError::ContractViolation(
                "draw without a bound pipeline".into(),
            ));
        }
        self.commands.push(BackendCommand::DrawIndexed { indices, instances });
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        self.require_no_pass("submit")?;
        self.submits += 1;
        self.commands.push(BackendCommand::Submit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::RenderPassDesc;

    fn color_target(backend: &mut HeadlessBackend) -> TextureId {
        backend
            .create_texture(&TextureDesc::d2(
                "target",
                64,
                64,
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            ))
            .unwrap()
    }

    #[test]
    fn test_draw_outside_pass_is_rejected() {
        let mut backend = HeadlessBackend::new();
        assert!(matches!(
            backend.draw(0..3, 0..1),
            Err(LumenError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_nested_pass_is_rejected() {
        let mut backend = HeadlessBackend::new();
        let target = color_target(&mut backend);
        let desc = RenderPassDesc::single("main", target, None, None);
        backend.begin_render_pass(&desc).unwrap();
        assert!(backend.begin_render_pass(&desc).is_err());
        backend.end_render_pass().unwrap();
        assert!(!backend.is_in_render_pass());
    }

    #[test]
    fn test_oversized_texture_rejected() {
        let mut backend = HeadlessBackend::with_capabilities(BackendCapabilities {
            max_texture_size: 256,
            ..Default::default()
        });
        let desc = TextureDesc::d2(
            "big",
            512,
            16,
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureUsages::TEXTURE_BINDING,
        );
        assert!(backend.create_texture(&desc).is_err());
    }

    #[test]
    fn test_buffer_write_bounds() {
        let mut backend = HeadlessBackend::new();
        let buffer = backend
            .create_buffer(
                &BufferDesc {
                    label: "ubo",
                    size: 16,
                    usage: wgpu::BufferUsages::UNIFORM,
                },
                None,
            )
            .unwrap();
        backend.write_buffer(buffer, 8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&backend.buffer_contents(buffer).unwrap()[8..12], &[1, 2, 3, 4]);
        assert!(backend.write_buffer(buffer, 14, &[0; 4]).is_err());

        backend.destroy_buffer(buffer);
        assert_eq!(backend.live_buffers(), 0);
        assert!(backend.write_buffer(buffer, 0, &[0]).is_err());
    }
}
