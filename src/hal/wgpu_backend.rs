//! wgpu Backend
//!
//! Maps [`RenderBackend`] onto a `wgpu::Device` / `wgpu::Queue` pair.
//!
//! wgpu render passes borrow their encoder, which does not fit a stateful
//! begin/end protocol. Pass calls are therefore recorded into a [`PassOp`]
//! list and replayed into a real `wgpu::RenderPass` when the pass ends.
//! Pipelines use auto-derived layouts; bind groups are created against
//! `pipeline.get_bind_group_layout(group)`.

use std::ops::Range;

use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use smallvec::SmallVec;

use super::{
    BackendCapabilities, BindGroupDesc, BindGroupId, BindingResource, BufferDesc, BufferId,
    PipelineId, RenderBackend, RenderPassDesc, RenderPipelineDesc, ShaderModuleId, TextureDesc,
    TextureId,
};
use crate::errors::{LumenError, Result};

enum PassOp {
    SetPipeline(PipelineId),
    SetBindGroup(u32, BindGroupId, SmallVec<[u32; 4]>),
    SetVertexBuffer(u32, BufferId),
    SetIndexBuffer(BufferId, wgpu::IndexFormat),
    Draw(Range<u32>, Range<u32>),
    DrawIndexed(Range<u32>, i32, Range<u32>),
}

struct PendingPass {
    desc: RenderPassDesc,
    ops: Vec<PassOp>,
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDesc,
}

/// Native GPU backend.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: BackendCapabilities,

    buffers: SlotMap<BufferId, wgpu::Buffer>,
    textures: SlotMap<TextureId, GpuTexture>,
    modules: SlotMap<ShaderModuleId, wgpu::ShaderModule>,
    pipelines: SlotMap<PipelineId, wgpu::RenderPipeline>,
    bind_groups: SlotMap<BindGroupId, wgpu::BindGroup>,
    samplers: FxHashMap<(wgpu::FilterMode, wgpu::AddressMode), wgpu::Sampler>,

    encoder: Option<wgpu::CommandEncoder>,
    pending: Option<PendingPass>,
}

impl WgpuBackend {
    /// Wraps an existing device and queue.
    #[must_use]
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let limits = device.limits();
        let caps = BackendCapabilities {
            max_texture_size: limits.max_texture_dimension_2d,
            max_texture_array_layers: limits.max_texture_array_layers,
            max_color_attachments: limits.max_color_attachments,
            storage_buffers: limits.max_storage_buffers_per_shader_stage > 0,
            float_render_targets: true,
            cube_render_targets: limits.max_texture_array_layers >= 6,
        };
        log::info!(
            "wgpu backend ready: max texture {} layers {}",
            caps.max_texture_size,
            caps.max_texture_array_layers
        );

        Self {
            device,
            queue,
            caps,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            modules: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            bind_groups: SlotMap::with_key(),
            samplers: FxHashMap::default(),
            encoder: None,
            pending: None,
        }
    }

    /// Requests a device from `adapter` and wraps it, blocking the caller.
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Result<Self> {
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Lumen Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| LumenError::Backend(e.to_string()))?;
        Ok(Self::new(device, queue))
    }

    #[must_use]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The default view of a texture, for presenting or external sampling.
    #[must_use]
    pub fn texture_view(&self, texture: TextureId) -> Option<&wgpu::TextureView> {
        self.textures.get(texture).map(|t| &t.view)
    }

    fn pending_ops(&mut self, call: &str) -> Result<&mut Vec<PassOp>> {
        match self.pending.as_mut() {
            Some(pass) => Ok(&mut pass.ops),
            None => Err(LumenError::ContractViolation(format!(
                "{call} called outside of a render pass"
            ))),
        }
    }

    fn layer_view(&self, texture: TextureId, layer: u32) -> Result<wgpu::TextureView> {
        let gpu = self
            .textures
            .get(texture)
            .ok_or(LumenError::InvalidHandle { kind: "texture" })?;
        Ok(gpu.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(gpu.desc.label),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_array_layer: layer,
            array_layer_count: Some(1),
            base_mip_level: 0,
            mip_level_count: Some(1),
            ..Default::default()
        }))
    }

    fn replay(&mut self, pending: PendingPass) -> Result<()> {
        let color_views = pending
            .desc
            .color_attachments
            .iter()
            .map(|a| self.layer_view(a.texture, a.layer))
            .collect::<Result<Vec<_>>>()?;
        let depth_view = match &pending.desc.depth_attachment {
            Some(d) => Some(self.layer_view(d.texture, d.layer)?),
            None => None,
        };

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = pending
            .desc
            .color_attachments
            .iter()
            .zip(color_views.iter())
            .map(|(attachment, view)| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: attachment
                            .clear
                            .map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })
            })
            .collect();

        let depth_stencil_attachment = pending.desc.depth_attachment.as_ref().and_then(|d| {
            depth_view
                .as_ref()
                .map(|view| wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: d.clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                })
        });

        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Lumen Frame Encoder"),
                })
        });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(pending.desc.label),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            for op in &pending.ops {
                match op {
                    PassOp::SetPipeline(id) => {
                        if let Some(pipeline) = self.pipelines.get(*id) {
                            pass.set_pipeline(pipeline);
                        }
                    }
                    PassOp::SetBindGroup(index, id, offsets) => {
                        if let Some(group) = self.bind_groups.get(*id) {
                            pass.set_bind_group(*index, group, offsets);
                        }
                    }
                    PassOp::SetVertexBuffer(slot, id) => {
                        if let Some(buffer) = self.buffers.get(*id) {
                            pass.set_vertex_buffer(*slot, buffer.slice(..));
                        }
                    }
                    PassOp::SetIndexBuffer(id, format) => {
                        if let Some(buffer) = self.buffers.get(*id) {
                            pass.set_index_buffer(buffer.slice(..), *format);
                        }
                    }
                    PassOp::Draw(vertices, instances) => {
                        pass.draw(vertices.clone(), instances.clone());
                    }
                    PassOp::DrawIndexed(indices, base_vertex, instances) => {
                        pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                    }
                }
            }
        }

        self.encoder = Some(encoder);
        Ok(())
    }

    fn bytes_per_texel(format: wgpu::TextureFormat) -> u32 {
        format.block_copy_size(None).unwrap_or(4)
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.caps
    }

    // === Buffers ===

    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId> {
        // Buffer sizes must be 4-byte aligned for queue writes.
        let size = desc.size.div_ceil(4) * 4;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage: desc.usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(contents) = contents {
            self.queue.write_buffer(&buffer, 0, contents);
        }
        Ok(self.buffers.insert(buffer))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let gpu = self
            .buffers
            .get(buffer)
            .ok_or(LumenError::InvalidHandle { kind: "buffer" })?;
        self.queue.write_buffer(gpu, offset, data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(gpu) = self.buffers.remove(buffer) {
            gpu.destroy();
        }
    }

    // === Textures ===

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers,
            },
            mip_level_count: desc.mip_level_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format,
            usage: desc.usage | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let dimension = if desc.cube {
            wgpu::TextureViewDimension::Cube
        } else if desc.layers > 1 {
            wgpu::TextureViewDimension::D2Array
        } else {
            wgpu::TextureViewDimension::D2
        };
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(desc.label),
            dimension: Some(dimension),
            ..Default::default()
        });
        Ok(self.textures.insert(GpuTexture {
            texture,
            view,
            desc: desc.clone(),
        }))
    }

    fn write_texture(&mut self, texture: TextureId, mip_level: u32, data: &[u8]) -> Result<()> {
        let gpu = self
            .textures
            .get(texture)
            .ok_or(LumenError::InvalidHandle { kind: "texture" })?;
        let width = (gpu.desc.width >> mip_level).max(1);
        let height = (gpu.desc.height >> mip_level).max(1);
        let bytes_per_row = width * Self::bytes_per_texel(gpu.desc.format);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &gpu.texture,
                mip_level,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(gpu) = self.textures.remove(texture) {
            gpu.texture.destroy();
        }
    }

    fn texture_desc(&self, texture: TextureId) -> Option<&TextureDesc> {
        self.textures.get(texture).map(|t| &t.desc)
    }

    // === Shaders & Pipelines ===

    fn create_shader_module(&mut self, label: &str, wgsl: &str) -> Result<ShaderModuleId> {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(wgsl.to_owned().into()),
            });
        Ok(self.modules.insert(module))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleId) {
        self.modules.remove(module);
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc<'_>) -> Result<PipelineId> {
        let module = self.modules.get(desc.module).ok_or(LumenError::InvalidHandle {
            kind: "shader module",
        })?;

        let attributes: Vec<wgpu::VertexAttribute> = desc
            .vertex_layout
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: a.format,
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let buffers: Vec<wgpu::VertexBufferLayout<'_>> = desc
            .vertex_layout
            .map(|layout| {
                vec![wgpu::VertexBufferLayout {
                    array_stride: layout.stride,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &attributes,
                }]
            })
            .unwrap_or_default();

        let targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_formats
            .iter()
            .map(|&format| {
                Some(wgpu::ColorTargetState {
                    format,
                    blend: desc.blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: None,
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some(desc.vertex_entry),
                    buffers: &buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: desc.fragment_entry.map(|entry| wgpu::FragmentState {
                    module,
                    entry_point: Some(entry),
                    targets: &targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: desc.topology,
                    cull_mode: desc.cull_mode,
                    ..Default::default()
                },
                depth_stencil: desc.depth_format.map(|format| wgpu::DepthStencilState {
                    format,
                    depth_write_enabled: desc.depth_write,
                    depth_compare: desc.depth_compare,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState {
                    count: desc.sample_count,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                multiview_mask: None,
                cache: None,
            });
        Ok(self.pipelines.insert(pipeline))
    }

    fn destroy_render_pipeline(&mut self, pipeline: PipelineId) {
        self.pipelines.remove(pipeline);
    }

    // === Bind Groups ===

    fn create_bind_group(&mut self, desc: &BindGroupDesc<'_>) -> Result<BindGroupId> {
        let pipeline = self
            .pipelines
            .get(desc.pipeline)
            .ok_or(LumenError::InvalidHandle { kind: "pipeline" })?;
        let layout = pipeline.get_bind_group_layout(desc.group);

        for (_, resource) in desc.entries {
            if let BindingResource::Sampler { filter, address } = *resource {
                self.samplers.entry((filter, address)).or_insert_with(|| {
                    self.device.create_sampler(&wgpu::SamplerDescriptor {
                        label: Some("Lumen Sampler"),
                        address_mode_u: address,
                        address_mode_v: address,
                        address_mode_w: address,
                        mag_filter: filter,
                        min_filter: filter,
                        ..Default::default()
                    })
                });
            }
        }

        let mut entries = Vec::with_capacity(desc.entries.len());
        for (binding, resource) in desc.entries {
            let resource = match *resource {
                BindingResource::Buffer {
                    buffer,
                    offset,
                    size,
                } => {
                    let gpu = self
                        .buffers
                        .get(buffer)
                        .ok_or(LumenError::InvalidHandle { kind: "buffer" })?;
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: gpu,
                        offset,
                        size: size.and_then(wgpu::BufferSize::new),
                    })
                }
                BindingResource::Texture(texture) => {
                    let gpu = self
                        .textures
                        .get(texture)
                        .ok_or(LumenError::InvalidHandle { kind: "texture" })?;
                    wgpu::BindingResource::TextureView(&gpu.view)
                }
                BindingResource::Sampler { filter, address } => {
                    let sampler = self
                        .samplers
                        .get(&(filter, address))
                        .ok_or(LumenError::InvalidHandle { kind: "sampler" })?;
                    wgpu::BindingResource::Sampler(sampler)
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(desc.label),
            layout: &layout,
            entries: &entries,
        });
        Ok(self.bind_groups.insert(group))
    }

    fn destroy_bind_group(&mut self, group: BindGroupId) {
        self.bind_groups.remove(group);
    }

    // === Pass Recording ===

    fn begin_render_pass(&mut self, desc: &RenderPassDesc) -> Result<()> {
        if self.pending.is_some() {
            return Err(LumenError::ContractViolation(
                "begin_render_pass called inside an active render pass".into(),
            ));
        }
        self.pending = Some(PendingPass {
            desc: desc.clone(),
            ops: Vec::with_capacity(64),
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> Result<()> {
        let pending = self.pending.take().ok_or_else(|| {
            LumenError::ContractViolation("end_render_pass without an active pass".into())
        })?;
        self.replay(pending)
    }

    fn is_in_render_pass(&self) -> bool {
        self.pending.is_some()
    }

    fn set_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        self.pending_ops("set_pipeline")?
            .push(PassOp::SetPipeline(pipeline));
        Ok(())
    }

    fn set_bind_group(&mut self, index: u32, group: BindGroupId, offsets: &[u32]) -> Result<()> {
        self.pending_ops("set_bind_group")?.push(PassOp::SetBindGroup(
            index,
            group,
            SmallVec::from_slice(offsets),
        ));
        Ok(())
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferId) -> Result<()> {
        self.pending_ops("set_vertex_buffer")?
            .push(PassOp::SetVertexBuffer(slot, buffer));
        Ok(())
    }

    fn set_index_buffer(&mut self, buffer: BufferId, format: wgpu::IndexFormat) -> Result<()> {
        self.pending_ops("set_index_buffer")?
            .push(PassOp::SetIndexBuffer(buffer, format));
        Ok(())
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) -> Result<()> {
        self.pending_ops("draw")?
            .push(PassOp::Draw(vertices, instances));
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    ) -> Result<()> {
        self.pending_ops("draw_indexed")?
            .push(PassOp::DrawIndexed(indices, base_vertex, instances));
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(LumenError::ContractViolation(
                "submit called inside an active render pass".into(),
            ));
        }
        let encoder = self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Lumen Frame Encoder"),
                })
        });
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}
