//! Bind group cache.
//!
//! Bind groups are keyed by the pipeline they were created against, the
//! group index and the exact resources bound. A group not used during a
//! frame is destroyed at the end of that frame.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::errors::Result;
use crate::hal::{BindGroupDesc, BindGroupId, BindingResource, PipelineId, RenderBackend};

pub type BindEntries = SmallVec<[(u32, BindingResource); 8]>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindGroupKey {
    pipeline: PipelineId,
    group: u32,
    entries: BindEntries,
}

struct CachedGroup {
    id: BindGroupId,
    last_used: u64,
}

#[derive(Default)]
pub struct BindGroupCache {
    groups: FxHashMap<BindGroupKey, CachedGroup>,
    frame: u64,
    created_this_frame: u32,
}

impl BindGroupCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_frame(&mut self, frame: u64) {
        self.frame = frame;
        self.created_this_frame = 0;
    }

    pub fn get_or_create(
        &mut self,
        backend: &mut dyn RenderBackend,
        label: &str,
        pipeline: PipelineId,
        group: u32,
        entries: BindEntries,
    ) -> Result<BindGroupId> {
        let key = BindGroupKey {
            pipeline,
            group,
            entries,
        };
        if let Some(cached) = self.groups.get_mut(&key) {
            cached.last_used = self.frame;
            return Ok(cached.id);
        }

        let id = backend.create_bind_group(&BindGroupDesc {
            label,
            pipeline,
            group,
            entries: &key.entries,
        })?;
        self.created_this_frame += 1;
        self.groups.insert(
            key,
            CachedGroup {
                id,
                last_used: self.frame,
            },
        );
        Ok(id)
    }

    /// Destroys groups that were not used during the current frame.
    pub fn end_frame(&mut self, backend: &mut dyn RenderBackend) {
        let frame = self.frame;
        self.groups.retain(|_, cached| {
            let keep = cached.last_used == frame;
            if !keep {
                backend.destroy_bind_group(cached.id);
            }
            keep
        });
    }

    pub fn clear(&mut self, backend: &mut dyn RenderBackend) {
        for (_, cached) in self.groups.drain() {
            backend.destroy_bind_group(cached.id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[must_use]
    pub fn created_this_frame(&self) -> u32 {
        self.created_this_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BufferDesc, HeadlessBackend, ShaderModuleId};
    use crate::hal::RenderPipelineDesc;
    use smallvec::smallvec;

    fn pipeline(backend: &mut HeadlessBackend) -> PipelineId {
        let module: ShaderModuleId = backend.create_shader_module("test", "fn main() {}").unwrap();
        backend
            .create_render_pipeline(&RenderPipelineDesc {
                label: "test",
                module,
                vertex_entry: "vs_main",
                fragment_entry: None,
                vertex_layout: None,
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                color_formats: &[],
                blend: None,
                depth_format: None,
                depth_write: false,
                depth_compare: wgpu::CompareFunction::Always,
                sample_count: 1,
            })
            .unwrap()
    }

    fn uniform_entries(backend: &mut HeadlessBackend) -> BindEntries {
        let buffer = backend
            .create_buffer(
                &BufferDesc {
                    label: "test",
                    size: 256,
                    usage: wgpu::BufferUsages::UNIFORM,
                },
                None,
            )
            .unwrap();
        smallvec![(
            0,
            BindingResource::Buffer {
                buffer,
                offset: 0,
                size: Some(64),
            }
        )]
    }

    #[test]
    fn test_identical_entries_share_group() {
        let mut backend = HeadlessBackend::new();
        let pipeline = pipeline(&mut backend);
        let entries = uniform_entries(&mut backend);
        let mut cache = BindGroupCache::new();
        cache.begin_frame(1);

        let a = cache
            .get_or_create(&mut backend, "g", pipeline, 0, entries.clone())
            .unwrap();
        let b = cache
            .get_or_create(&mut backend, "g", pipeline, 0, entries)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.created_this_frame(), 1);
    }

    #[test]
    fn test_unused_groups_destroyed_at_frame_end() {
        let mut backend = HeadlessBackend::new();
        let pipeline = pipeline(&mut backend);
        let entries = uniform_entries(&mut backend);
        let mut cache = BindGroupCache::new();

        cache.begin_frame(1);
        cache
            .get_or_create(&mut backend, "g", pipeline, 0, entries)
            .unwrap();
        cache.end_frame(&mut backend);
        assert_eq!(cache.len(), 1);

        cache.begin_frame(2);
        cache.end_frame(&mut backend);
        assert!(cache.is_empty());
    }
}
