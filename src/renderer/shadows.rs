//! Shadow Maps
//!
//! One entry per shadow-casting light, keyed by the light's index in the
//! layer light list. An entry whose size, layer count or mode no longer
//! matches the request is destroyed and recreated, never patched.
//!
//! | Mode | Lights | Targets |
//! |------|--------|---------|
//! | `Vsm` | directional, spot | depth + `Rgba16Float` moments |
//! | `Pcf` | directional, spot | depth only |
//! | `Cube` | point | 6-layer depth + 6-layer `Rgba16Float` distance cube |

use glam::{Mat4, Vec3};
use smallvec::SmallVec;

use crate::errors::Result;
use crate::hal::{RenderBackend, TextureDesc, TextureId};
use crate::resources::Aabb;
use crate::scene::NodeId;

pub const SHADOW_MOMENTS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const SHADOW_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowMode {
    Vsm,
    Pcf,
    Cube,
}

impl ShadowMode {
    #[must_use]
    pub fn layers(self) -> u32 {
        match self {
            Self::Cube => 6,
            Self::Vsm | Self::Pcf => 1,
        }
    }
}

#[derive(Debug)]
pub struct ShadowMapEntry {
    pub light_index: usize,
    pub light: NodeId,
    pub mode: ShadowMode,
    pub size: u32,
    pub layers: u32,
    pub depth: TextureId,
    /// Moments (VSM) or distance cube; `None` for PCF.
    pub color: Option<TextureId>,
    /// One per layer.
    pub view_projections: SmallVec<[Mat4; 6]>,
    used: bool,
}

impl ShadowMapEntry {
    /// The texture the material shaders sample.
    #[must_use]
    pub fn sampled_texture(&self) -> TextureId {
        self.color.unwrap_or(self.depth)
    }

    #[must_use]
    pub fn is_compatible(&self, mode: ShadowMode, size: u32, layers: u32) -> bool {
        self.mode == mode && self.size == size && self.layers == layers
    }

    fn destroy(&self, backend: &mut dyn RenderBackend) {
        backend.destroy_texture(self.depth);
        if let Some(color) = self.color {
            backend.destroy_texture(color);
        }
    }
}

#[derive(Default)]
pub struct ShadowMapManager {
    entries: Vec<ShadowMapEntry>,
    created: u64,
}

impl ShadowMapManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `light_index`, creating or recreating it when
    /// missing or incompatible.
    pub fn add_entry(
        &mut self,
        backend: &mut dyn RenderBackend,
        light_index: usize,
        light: NodeId,
        mode: ShadowMode,
        size: u32,
        layers: u32,
    ) -> Result<&mut ShadowMapEntry> {
        let position = self.entries.iter().position(|e| e.light_index == light_index);
        if let Some(i) = position {
            if self.entries[i].is_compatible(mode, size, layers) {
                let entry = &mut self.entries[i];
                entry.light = light;
                entry.used = true;
                return Ok(entry);
            }
            log::debug!("Shadow map {light_index} incompatible, recreating");
            self.entries.swap_remove(i).destroy(backend);
        }

        let usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        let depth = backend.create_texture(&TextureDesc {
            layers,
            ..TextureDesc::d2("lumen.shadow.depth", size, size, SHADOW_DEPTH_FORMAT, usage)
        })?;
        let color = match mode {
            ShadowMode::Pcf => None,
            ShadowMode::Vsm | ShadowMode::Cube => {
                let desc = TextureDesc {
                    layers,
                    cube: mode == ShadowMode::Cube,
                    ..TextureDesc::d2("lumen.shadow.color", size, size, SHADOW_MOMENTS_FORMAT, usage)
                };
                match backend.create_texture(&desc) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        backend.destroy_texture(depth);
                        return Err(err);
                    }
                }
            }
        };

        self.created += 1;
        self.entries.push(ShadowMapEntry {
            light_index,
            light,
            mode,
            size,
            layers,
            depth,
            color,
            view_projections: SmallVec::new(),
            used: true,
        });
        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }

    #[must_use]
    pub fn entry(&self, light_index: usize) -> Option<&ShadowMapEntry> {
        self.entries.iter().find(|e| e.light_index == light_index)
    }

    #[must_use]
    pub fn entries(&self) -> &[ShadowMapEntry] {
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

    /// Entries created over the manager's lifetime.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created
    }

    /// Starts a preparation pass; entries not re-added before
    /// [`prune`](Self::prune) are released.
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

// ============================================================================
// Light matrices
// ============================================================================

fn safe_direction(direction: Vec3) -> Vec3 {
    if direction.length_squared() > 1e-6 {
        direction.normalize()
    } else {
        Vec3::NEG_Z
    }
}

fn up_for(direction: Vec3) -> Vec3 {
    if direction.y.abs() > 0.99 { Vec3::X } else { Vec3::Y }
}

/// Orthographic fit around `casters`, snapped to the texel grid.
#[must_use]
pub fn directional_view_projection(direction: Vec3, casters: &Aabb, map_size: u32) -> Mat4 {
    let dir = safe_direction(direction);
    let (center, radius) = if casters.is_empty() {
        (Vec3::ZERO, 1.0)
    } else {
        (casters.center(), casters.radius().max(0.01))
    };

    let view = Mat4::look_at_rh(center - dir * radius * 2.0, center, up_for(dir));
    let mut extent = radius;
    let texel = 2.0 * extent / map_size.max(1) as f32;
    if texel > 0.0 {
        extent = (extent / texel).ceil() * texel;
    }
    let proj = Mat4::orthographic_rh(-extent, extent, -extent, extent, radius * 0.5, radius * 3.5);
    proj * view
}

/// Perspective from the spot cone. `outer` is the outer half-angle.
#[must_use]
pub fn spot_view_projection(position: Vec3, direction: Vec3, outer: f32, range: f32) -> Mat4 {
    let dir = safe_direction(direction);
    let view = Mat4::look_at_rh(position, position + dir, up_for(dir));
    let fov = (outer * 2.0).clamp(0.1, std::f32::consts::PI - 0.01);
    let far = range.max(1.0);
    Mat4::perspective_rh(fov, 1.0, 0.05, far) * view
}

/// Six 90° views in +X, -X, +Y, -Y, +Z, -Z order.
#[must_use]
pub fn cube_face_view_projections(position: Vec3, range: f32) -> [Mat4; 6] {
    let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.05, range.max(1.0));
    let faces = [
        (Vec3::X, Vec3::NEG_Y),
        (Vec3::NEG_X, Vec3::NEG_Y),
        (Vec3::Y, Vec3::Z),
        (Vec3::NEG_Y, Vec3::NEG_Z),
        (Vec3::Z, Vec3::NEG_Y),
        (Vec3::NEG_Z, Vec3::NEG_Y),
    ];
    faces.map(|(forward, up)| proj * Mat4::look_at_rh(position, position + forward, up))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HeadlessBackend;
    use slotmap::SlotMap;

    fn light_id() -> NodeId {
        let mut map: SlotMap<NodeId, ()> = SlotMap::with_key();
        map.insert(())
    }

    #[test]
    fn test_entry_reused_when_compatible() {
        let mut backend = HeadlessBackend::new();
        let mut manager = ShadowMapManager::new();
        let light = light_id();

        let first = manager
            .add_entry(&mut backend, 0, light, ShadowMode::Vsm, 512, 1)
            .unwrap()
            .depth;
        let second = manager
            .add_entry(&mut backend, 0, light, ShadowMode::Vsm, 512, 1)
            .unwrap()
            .depth;
        assert_eq!(first, second);
        assert_eq!(manager.created_count(), 1);
        assert_eq!(backend.live_textures(), 2);
    }

    #[test]
    fn test_incompatible_entry_recreated() {
        let mut backend = HeadlessBackend::new();
        let mut manager = ShadowMapManager::new();
        let light = light_id();

        let old = manager
            .add_entry(&mut backend, 0, light, ShadowMode::Vsm, 512, 1)
            .unwrap()
            .depth;
        let new = manager
            .add_entry(&mut backend, 0, light, ShadowMode::Pcf, 1024, 1)
            .unwrap();
        assert!(new.color.is_none());
        assert_eq!(new.size, 1024);
        assert!(!backend.texture_exists(old));
        assert_eq!(manager.len(), 1);
        assert_eq!(backend.live_textures(), 1);
    }

    #[test]
    fn test_prune_releases_unused() {
        let mut backend = HeadlessBackend::new();
        let mut manager = ShadowMapManager::new();
        let light = light_id();
        manager
            .add_entry(&mut backend, 0, light, ShadowMode::Cube, 256, 6)
            .unwrap();

        manager.begin_prepare();
        manager.prune(&mut backend);
        assert!(manager.is_empty());
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_directional_matrix_contains_casters() {
        let bounds = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let vp = directional_view_projection(Vec3::new(0.0, -1.0, -1.0), &bounds, 1024);
        for corner in [Vec3::splat(-1.0), Vec3::splat(1.0), Vec3::ZERO] {
            let ndc = vp.project_point3(corner);
            assert!(ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0, "{ndc:?}");
            assert!((0.0..=1.0).contains(&ndc.z), "{ndc:?}");
        }
    }

    #[test]
    fn test_cube_faces_look_outward() {
        let faces = cube_face_view_projections(Vec3::ZERO, 10.0);
        let ndc = faces[0].project_point3(Vec3::new(5.0, 0.0, 0.0));
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!((0.0..1.0).contains(&ndc.z));
    }
}
