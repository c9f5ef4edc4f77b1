//! Resolved draws and their recording.

use std::ops::Range;

use glam::Vec4;

use crate::errors::Result;
use crate::extensions::{FrameData, RenderExtension, RenderMode, RenderStage};
use crate::hal::{BindGroupId, BufferId, PipelineId, RenderBackend, RenderPassDesc};

use super::pass::TrackedPass;
use super::FrameStats;

/// One fully resolved draw. Built during `rhi_prepare`, replayed inside a
/// pass.
#[derive(Debug, Clone)]
pub(crate) struct DrawItem {
    pub pipeline: PipelineId,
    pub bind_groups: [Option<BindGroupId>; 4],
    pub vertex_buffer: BufferId,
    pub index_buffer: Option<(BufferId, wgpu::IndexFormat)>,
    /// Index range when indexed, vertex range otherwise.
    pub range: Range<u32>,
    pub instances: u32,
}

/// A fullscreen triangle with a single bind group.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FullscreenDraw {
    pub pipeline: PipelineId,
    pub bind_group: BindGroupId,
}

impl FullscreenDraw {
    pub fn record(&self, pass: &mut TrackedPass<'_>) -> Result<()> {
        pass.set_pipeline(self.pipeline)?;
        pass.set_bind_group(0, self.bind_group, &[])?;
        pass.draw(0..3, 0..1)
    }
}

pub(crate) fn record_draws(pass: &mut TrackedPass<'_>, items: &[DrawItem]) -> Result<()> {
    for item in items {
        pass.set_pipeline(item.pipeline)?;
        for (index, group) in item.bind_groups.iter().enumerate() {
            if let Some(group) = group {
                pass.set_bind_group(index as u32, *group, &[])?;
            }
        }
        pass.set_vertex_buffer(0, item.vertex_buffer)?;
        let instances = 0..item.instances.max(1);
        match item.index_buffer {
            Some((buffer, format)) => {
                pass.set_index_buffer(buffer, format)?;
                pass.draw_indexed(item.range.clone(), 0, instances)?;
            }
            None => pass.draw(item.range.clone(), instances)?,
        }
    }
    Ok(())
}

/// Begins `desc`, replays `items` and always ends the pass.
pub(crate) fn run_pass(
    backend: &mut dyn RenderBackend,
    desc: &RenderPassDesc,
    items: &[DrawItem],
    stats: &mut FrameStats,
) -> Result<()> {
    backend.begin_render_pass(desc)?;
    let mut pass = TrackedPass::new(backend);
    let recorded = record_draws(&mut pass, items);
    stats.draw_calls += pass.draws();
    stats.state_changes_skipped += pass.skipped();
    drop(pass);
    let ended = backend.end_render_pass();
    recorded.and(ended)
}

/// Main-mode extensions around the layer's opaque and transparent draws.
/// The caller has the pass open.
pub(crate) fn record_layer(
    backend: &mut dyn RenderBackend,
    draws: &[DrawItem],
    frame_data: &FrameData,
    extensions: &mut [Box<dyn RenderExtension>],
    stats: &mut FrameStats,
) -> Result<()> {
    render_extensions(backend, frame_data, extensions, RenderMode::Main, RenderStage::PreColor)?;

    let mut pass = TrackedPass::new(&mut *backend);
    let recorded = record_draws(&mut pass, draws);
    stats.draw_calls += pass.draws();
    stats.state_changes_skipped += pass.skipped();
    drop(pass);
    recorded?;

    render_extensions(backend, frame_data, extensions, RenderMode::Main, RenderStage::PostColor)
}

pub(crate) fn render_extensions(
    backend: &mut dyn RenderBackend,
    frame_data: &FrameData,
    extensions: &mut [Box<dyn RenderExtension>],
    mode: RenderMode,
    stage: RenderStage,
) -> Result<()> {
    for extension in extensions
        .iter_mut()
        .filter(|e| e.mode() == mode && e.stage() == stage)
    {
        extension.render(frame_data, backend)?;
    }
    Ok(())
}

pub(crate) fn to_wgpu_color(color: Vec4) -> wgpu::Color {
    wgpu::Color {
        r: f64::from(color.x),
        g: f64::from(color.y),
        b: f64::from(color.z),
        a: f64::from(color.w),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BufferDesc, HeadlessBackend, RenderPipelineDesc, TextureDesc};

    fn draw_item(backend: &mut HeadlessBackend, indexed: bool) -> DrawItem {
        let module = backend.create_shader_module("test", "fn main() {}").unwrap();
        let pipeline = backend
            .create_render_pipeline(&RenderPipelineDesc {
                label: "test",
                module,
                vertex_entry: "vs_main",
                fragment_entry: Some("fs_main"),
                vertex_layout: None,
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                color_formats: &[wgpu::TextureFormat::Rgba8Unorm],
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
                    usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::INDEX,
                },
                None,
            )
            .unwrap();
        DrawItem {
            pipeline,
            bind_groups: [None; 4],
            vertex_buffer: buffer,
            index_buffer: indexed.then_some((buffer, wgpu::IndexFormat::Uint16)),
            range: 0..6,
            instances: 1,
        }
    }

    #[test]
    fn test_run_pass_skips_repeated_binds() {
        let mut backend = HeadlessBackend::new();
        let target = backend
            .create_texture(&TextureDesc::d2(
                "target",
                4,
                4,
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            ))
            .unwrap();
        let item = draw_item(&mut backend, true);
        let items = [item.clone(), item];

        let mut stats = FrameStats::default();
        let desc = RenderPassDesc::single("test", target, None, None);
        run_pass(&mut backend, &desc, &items, &mut stats).unwrap();

        assert_eq!(stats.draw_calls, 2);
        // Pipeline, vertex and index buffer of the second draw.
        assert_eq!(stats.state_changes_skipped, 3);
        assert!(!backend.is_in_render_pass());
    }

    #[test]
    fn test_color_conversion() {
        let color = to_wgpu_color(Vec4::new(1.0, 0.5, 0.0, 1.0));
        assert_eq!(color.g, 0.5);
    }
}
