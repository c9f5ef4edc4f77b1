//! Tracked render pass.
//!
//! Wraps the backend while a pass is open and drops binds that would not
//! change state.

use std::ops::Range;

use crate::errors::Result;
use crate::hal::{BindGroupId, BufferId, PipelineId, RenderBackend};

const MAX_BIND_GROUPS: usize = 4;
const MAX_VERTEX_BUFFERS: usize = 8;

#[derive(Clone, Copy, PartialEq)]
struct BindGroupState {
    id: BindGroupId,
    offsets: [u32; 8],
    offset_count: u8,
}

pub struct TrackedPass<'a> {
    backend: &'a mut dyn RenderBackend,
    pipeline: Option<PipelineId>,
    bind_groups: [Option<BindGroupState>; MAX_BIND_GROUPS],
    vertex_buffers: [Option<BufferId>; MAX_VERTEX_BUFFERS],
    index_buffer: Option<BufferId>,
    skipped: u32,
    draws: u32,
}

impl<'a> TrackedPass<'a> {
    pub fn new(backend: &'a mut dyn RenderBackend) -> Self {
        Self {
            backend,
            pipeline: None,
            bind_groups: [None; MAX_BIND_GROUPS],
            vertex_buffers: [None; MAX_VERTEX_BUFFERS],
            index_buffer: None,
            skipped: 0,
            draws: 0,
        }
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        if self.pipeline == Some(pipeline) {
            self.skipped += 1;
            return Ok(());
        }
        self.backend.set_pipeline(pipeline)?;
        self.pipeline = Some(pipeline);
        // Bind groups are created against a pipeline layout.
        self.bind_groups = [None; MAX_BIND_GROUPS];
        Ok(())
    }

    pub fn set_bind_group(&mut self, index: u32, group: BindGroupId, offsets: &[u32]) -> Result<()> {
        let slot = index as usize;
        let mut state = BindGroupState {
            id: group,
            offsets: [0; 8],
            offset_count: offsets.len().min(8) as u8,
        };
        let len = offsets.len().min(8);
        state.offsets[..len].copy_from_slice(&offsets[..len]);

        if slot < MAX_BIND_GROUPS && self.bind_groups[slot] == Some(state) {
            self.skipped += 1;
            return Ok(());
        }
        self.backend.set_bind_group(index, group, offsets)?;
        if slot < MAX_BIND_GROUPS {
            self.bind_groups[slot] = Some(state);
        }
        Ok(())
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferId) -> Result<()> {
        let index = slot as usize;
        if index < MAX_VERTEX_BUFFERS && self.vertex_buffers[index] == Some(buffer) {
            self.skipped += 1;
            return Ok(());
        }
        self.backend.set_vertex_buffer(slot, buffer)?;
        if index < MAX_VERTEX_BUFFERS {
            self.vertex_buffers[index] = Some(buffer);
        }
        Ok(())
    }

    pub fn set_index_buffer(&mut self, buffer: BufferId, format: wgpu::IndexFormat) -> Result<()> {
        if self.index_buffer == Some(buffer) {
            self.skipped += 1;
            return Ok(());
        }
        self.backend.set_index_buffer(buffer, format)?;
        self.index_buffer = Some(buffer);
        Ok(())
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) -> Result<()> {
        self.draws += 1;
        self.backend.draw(vertices, instances)
    }

    pub fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) -> Result<()> {
        self.draws += 1;
        self.backend.draw_indexed(indices, base_vertex, instances)
    }

    /// Raw backend access. Clears tracked state, since the caller may bind
    /// anything.
    pub fn backend(&mut self) -> &mut dyn RenderBackend {
        self.pipeline = None;
        self.bind_groups = [None; MAX_BIND_GROUPS];
        self.vertex_buffers = [None; MAX_VERTEX_BUFFERS];
        self.index_buffer = None;
        &mut *self.backend
    }

    /// Binds skipped so far.
    #[must_use]
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    #[must_use]
    pub fn draws(&self) -> u32 {
        self.draws
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{
        BackendCommand, BufferDesc, HeadlessBackend, RenderPassDesc, RenderPipelineDesc, TextureDesc,
    };

    #[test]
    fn test_redundant_binds_skipped() {
        let mut backend = HeadlessBackend::new();
        let module = backend.create_shader_module("test", "fn main() {}").unwrap();
        let formats = [wgpu::TextureFormat::Rgba8Unorm];
        let pipeline = backend
            .create_render_pipeline(&RenderPipelineDesc {
                label: "test",
                module,
                vertex_entry: "vs_main",
                fragment_entry: Some("fs_main"),
                vertex_layout: None,
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                color_formats: &formats,
                blend: None,
                depth_format: None,
                depth_write: false,
                depth_compare: wgpu::CompareFunction::Always,
                sample_count: 1,
            })
            .unwrap();
        let buffer = backend
            .create_buffer(
                &BufferDesc {
                    label: "vb",
                    size: 64,
                    usage: wgpu::BufferUsages::VERTEX,
                },
                None,
            )
            .unwrap();
        let target = backend
            .create_texture(&TextureDesc::d2(
                "target",
                4,
                4,
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            ))
            .unwrap();
        backend
            .begin_render_pass(&RenderPassDesc::single("main", target, None, None))
            .unwrap();
        backend.clear_commands();

        let mut pass = TrackedPass::new(&mut backend);
        for _ in 0..3 {
            pass.set_pipeline(pipeline).unwrap();
            pass.set_vertex_buffer(0, buffer).unwrap();
            pass.draw(0..3, 0..1).unwrap();
        }
        assert_eq!(pass.skipped(), 4);
        assert_eq!(pass.draws(), 3);

        let set_pipelines = backend
            .commands()
            .iter()
            .filter(|c| matches!(c, BackendCommand::SetPipeline(_)))
            .count();
        assert_eq!(set_pipelines, 1);
    }
}
