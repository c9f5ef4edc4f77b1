//! Reflection probe cube maps.
//!
//! Entries are keyed by probe index within the layer and follow the same
//! rule as shadow maps: a resolution change destroys and recreates the
//! entry.

use glam::{Mat4, Vec3};

use crate::errors::Result;
use crate::hal::{RenderBackend, TextureDesc, TextureId};
use crate::scene::{NodeId, ReflectionRefreshMode};

use super::shadows::cube_face_view_projections;

pub const REFLECTION_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const REFLECTION_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Far plane used for probe face projections.
const PROBE_FAR: f32 = 1000.0;

#[derive(Debug)]
pub struct ReflectionMapEntry {
    pub probe_index: usize,
    pub probe: NodeId,
    pub size: u32,
    pub color: TextureId,
    pub depth: TextureId,
    pub refresh: ReflectionRefreshMode,
    pub position: Vec3,
    /// Set once the faces have been rendered.
    pub rendered: bool,
    used: bool,
}

impl ReflectionMapEntry {
    #[must_use]
    pub fn needs_render(&self) -> bool {
        match self.refresh {
            ReflectionRefreshMode::FirstFrame => !self.rendered,
            ReflectionRefreshMode::EveryFrame => true,
        }
    }

    #[must_use]
    pub fn face_view_projections(&self) -> [Mat4; 6] {
        cube_face_view_projections(self.position, PROBE_FAR)
    }

    fn destroy(&self, backend: &mut dyn RenderBackend) {
        backend.destroy_texture(self.color);
        backend.destroy_texture(self.depth);
    }
}

#[derive(Default)]
pub struct ReflectionMapManager {
    entries: Vec<ReflectionMapEntry>,
}

impl ReflectionMapManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(
        &mut self,
        backend: &mut dyn RenderBackend,
        probe_index: usize,
        probe: NodeId,
        size: u32,
    ) -> Result<&mut ReflectionMapEntry> {
        if let Some(i) = self.entries.iter().position(|e| e.probe_index == probe_index) {
            if self.entries[i].size == size && self.entries[i].probe == probe {
                let entry = &mut self.entries[i];
                entry.used = true;
                return Ok(entry);
            }
            log::debug!("Reflection map {probe_index} incompatible, recreating");
            self.entries.swap_remove(i).destroy(backend);
        }

        let usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        let color = backend.create_texture(&TextureDesc {
            layers: 6,
            cube: true,
            ..TextureDesc::d2("lumen.reflection.color", size, size, REFLECTION_COLOR_FORMAT, usage)
        })?;
        let depth = match backend.create_texture(&TextureDesc {
            layers: 6,
            ..TextureDesc::d2(
                "lumen.reflection.depth",
                size,
                size,
                REFLECTION_DEPTH_FORMAT,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            )
        }) {
            Ok(id) => id,
            Err(err) => {
                backend.destroy_texture(color);
                return Err(err);
            }
        };

        self.entries.push(ReflectionMapEntry {
            probe_index,
            probe,
            size,
            color,
            depth,
            refresh: ReflectionRefreshMode::FirstFrame,
            position: Vec3::ZERO,
            rendered: false,
            used: true,
        });
        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }

    #[must_use]
    pub fn entry(&self, probe_index: usize) -> Option<&ReflectionMapEntry> {
        self.entries.iter().find(|e| e.probe_index == probe_index)
    }

    pub(crate) fn entry_mut(&mut self, probe_index: usize) -> Option<&mut ReflectionMapEntry> {
        self.entries.iter_mut().find(|e| e.probe_index == probe_index)
    }

    #[must_use]
    pub fn entries(&self) -> &[ReflectionMapEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn begin_prepare(&mut self) {
        for entry in &mut self.entries {
            entry.used = false;
        }
    }

    pub fn prune(&mut self, backend: &mut dyn RenderBackend) {
        self.entries.retain(|entry| {
            if !entry.used {
                entry.destroy(backend);
            }
            entry.used
        });
    }

    pub fn release_all(&mut self, backend: &mut dyn RenderBackend) {
        for entry in self.entries.drain(..) {
            entry.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HeadlessBackend;
    use slotmap::SlotMap;

    fn probe_ids() -> (NodeId, NodeId) {
        let mut map: SlotMap<NodeId, ()> = SlotMap::with_key();
        (map.insert(()), map.insert(()))
    }

    #[test]
    fn test_first_frame_refresh_renders_once() {
        let mut backend = HeadlessBackend::new();
        let mut manager = ReflectionMapManager::new();
        let (probe, _) = probe_ids();

        let entry = manager.add_entry(&mut backend, 0, probe, 64).unwrap();
        assert!(entry.needs_render());
        entry.rendered = true;
        assert!(!entry.needs_render());
        entry.refresh = ReflectionRefreshMode::EveryFrame;
        assert!(entry.needs_render());
    }

    #[test]
    fn test_resolution_change_recreates() {
        let mut backend = HeadlessBackend::new();
        let mut manager = ReflectionMapManager::new();
        let (probe, _) = probe_ids();

        let old = manager.add_entry(&mut backend, 0, probe, 64).unwrap().color;
        let new = manager.add_entry(&mut backend, 0, probe, 128).unwrap().color;
        assert_ne!(old, new);
        assert!(!backend.texture_exists(old));
        assert_eq!(backend.live_textures(), 2);
    }

    #[test]
    fn test_probe_change_recreates() {
        let mut backend = HeadlessBackend::new();
        let mut manager = ReflectionMapManager::new();
        let (a, b) = probe_ids();

        manager.add_entry(&mut backend, 0, a, 64).unwrap().rendered = true;
        let entry = manager.add_entry(&mut backend, 0, b, 64).unwrap();
        assert!(!entry.rendered);
        assert_eq!(manager.len(), 1);
    }
}
