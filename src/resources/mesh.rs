//! Mesh data and its GPU-side form.
//!
//! [`MeshData`] is the planar, serde-friendly form produced by asset
//! providers. On upload it is validated and interleaved into one vertex
//! buffer; each attribute has a fixed shader location:
//!
//! | Attribute | Location | Format |
//! |-----------|----------|--------|
//! | position  | 0 | `Float32x3` |
//! | normal    | 1 | `Float32x3` |
//! | uv0       | 2 | `Float32x2` |
//! | uv1       | 3 | `Float32x2` |
//! | tangent   | 4 | `Float32x4` |
//! | color     | 5 | `Float32x4` |
//! | joints    | 6 | `Uint16x4`  |
//! | weights   | 7 | `Float32x4` |
//!
//! Morph target deltas follow from location 8: one `Float32x3` position
//! delta per target, then normal deltas for the first targets that fit in
//! the remaining eight locations (see [`MorphLayout`]).

use std::sync::Arc;

use bitflags::bitflags;
use glam::{Affine3A, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::errors::{LumenError, Result};
use crate::hal::{BufferId, VertexAttributeDesc, VertexLayoutDesc};
use crate::scene::Ray;

/// Blend shapes beyond this are ignored.
pub const MAX_MORPH_TARGETS: usize = 8;
/// Only the first targets carry normal deltas.
pub const MAX_MORPH_NORMALS: usize = 4;
const MORPH_LOCATION_BASE: u32 = 8;
const MORPH_LOCATIONS: u32 = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VertexAttributes: u32 {
        const POSITION = 1 << 0;
        const NORMAL = 1 << 1;
        const UV0 = 1 << 2;
        const UV1 = 1 << 3;
        const TANGENT = 1 << 4;
        const COLOR = 1 << 5;
        const JOINTS = 1 << 6;
        const WEIGHTS = 1 << 7;
    }
}

impl VertexAttributes {
    /// Interleaved layout in location order. Pipelines derive their vertex
    /// state from the attribute set alone.
    #[must_use]
    pub fn layout(self) -> VertexLayoutDesc {
        let table: [(VertexAttributes, wgpu::VertexFormat, u32); 8] = [
            (Self::POSITION, wgpu::VertexFormat::Float32x3, 0),
            (Self::NORMAL, wgpu::VertexFormat::Float32x3, 1),
            (Self::UV0, wgpu::VertexFormat::Float32x2, 2),
            (Self::UV1, wgpu::VertexFormat::Float32x2, 3),
            (Self::TANGENT, wgpu::VertexFormat::Float32x4, 4),
            (Self::COLOR, wgpu::VertexFormat::Float32x4, 5),
            (Self::JOINTS, wgpu::VertexFormat::Uint16x4, 6),
            (Self::WEIGHTS, wgpu::VertexFormat::Float32x4, 7),
        ];
        let mut attributes = SmallVec::new();
        let mut offset = 0;
        for (flag, format, location) in table {
            if self.contains(flag) {
                attributes.push(VertexAttributeDesc {
                    format,
                    offset,
                    location,
                });
                offset += format.size();
            }
        }
        VertexLayoutDesc {
            stride: offset,
            attributes,
        }
    }
}

/// How many morph targets reach the vertex stage and how many of them
/// carry normal deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MorphLayout {
    pub targets: u32,
    pub normals: u32,
}

impl MorphLayout {
    /// Position deltas take one location each; normal deltas fill what is
    /// left of the morph locations, capped at [`MAX_MORPH_NORMALS`].
    #[must_use]
    pub fn new(targets: usize, with_normals: bool) -> Self {
        let targets = targets.min(MAX_MORPH_TARGETS) as u32;
        let normals = if with_normals {
            targets.min(MAX_MORPH_NORMALS as u32).min(MORPH_LOCATIONS - targets)
        } else {
            0
        };
        Self { targets, normals }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.targets == 0
    }

    /// Appends the delta attributes to a base layout.
    pub fn extend(self, layout: &mut VertexLayoutDesc) {
        let slots = self.targets + self.normals;
        for i in 0..slots {
            layout.attributes.push(VertexAttributeDesc {
                format: wgpu::VertexFormat::Float32x3,
                offset: layout.stride,
                location: MORPH_LOCATION_BASE + i,
            });
            layout.stride += wgpu::VertexFormat::Float32x3.size();
        }
    }
}

/// A coarser element range drawn in place of its subset once the mesh is
/// small enough on screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshLod {
    pub offset: u32,
    pub count: u32,
    /// Object-space size at which this level takes over.
    pub distance: f32,
}

/// A contiguous range of indices (or vertices, when not indexed) drawn with
/// one material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSubset {
    #[serde(default)]
    pub name: String,
    pub offset: u32,
    pub count: u32,
    /// Finest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lods: Vec<MeshLod>,
}

/// Per-vertex deltas of one blend shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MorphTargetData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
}

/// Planar mesh data. Empty attribute arrays mean the attribute is absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uv0: Vec<[f32; 2]>,
    pub uv1: Vec<[f32; 2]>,
    pub tangents: Vec<[f32; 4]>,
    pub colors: Vec<[f32; 4]>,
    pub joints: Vec<[u16; 4]>,
    pub weights: Vec<[f32; 4]>,
    pub indices: Vec<u32>,
    /// Empty means one subset covering everything.
    pub subsets: Vec<MeshSubset>,
    pub morph_targets: Vec<MorphTargetData>,
}

impl MeshData {
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of elements a subset can address.
    #[must_use]
    pub fn element_count(&self) -> usize {
        if self.indices.is_empty() {
            self.positions.len()
        } else {
            self.indices.len()
        }
    }

    #[must_use]
    pub fn attributes(&self) -> VertexAttributes {
        let mut attrs = VertexAttributes::empty();
        attrs.set(VertexAttributes::POSITION, !self.positions.is_empty());
        attrs.set(VertexAttributes::NORMAL, !self.normals.is_empty());
        attrs.set(VertexAttributes::UV0, !self.uv0.is_empty());
        attrs.set(VertexAttributes::UV1, !self.uv1.is_empty());
        attrs.set(VertexAttributes::TANGENT, !self.tangents.is_empty());
        attrs.set(VertexAttributes::COLOR, !self.colors.is_empty());
        attrs.set(VertexAttributes::JOINTS, !self.joints.is_empty());
        attrs.set(VertexAttributes::WEIGHTS, !self.weights.is_empty());
        attrs
    }

    /// Checks internal consistency. `source_name` labels the error.
    pub fn validate(&self, source_name: &str) -> Result<()> {
        let fail = |reason: String| {
            Err(LumenError::MalformedMesh {
                source_name: source_name.to_owned(),
                reason,
            })
        };

        let n = self.positions.len();
        if n == 0 {
            return fail("no vertex positions".into());
        }
        let lengths = [
            ("normals", self.normals.len()),
            ("uv0", self.uv0.len()),
            ("uv1", self.uv1.len()),
            ("tangents", self.tangents.len()),
            ("colors", self.colors.len()),
            ("joints", self.joints.len()),
            ("weights", self.weights.len()),
        ];
        for (name, len) in lengths {
            if len != 0 && len != n {
                return fail(format!("{name} has {len} entries for {n} vertices"));
            }
        }
        if self.positions.iter().flatten().any(|v| !v.is_finite()) {
            return fail("non-finite vertex position".into());
        }
        if !self.indices.is_empty() {
            if self.indices.len() % 3 != 0 {
                return fail(format!("index count {} is not a multiple of 3", self.indices.len()));
            }
            if let Some(&bad) = self.indices.iter().find(|&&i| i as usize >= n) {
                return fail(format!("index {bad} out of range for {n} vertices"));
            }
        }
        let elements = self.element_count();
        for subset in &self.subsets {
            if subset.offset as usize + subset.count as usize > elements {
                return fail(format!(
                    "subset '{}' [{}, +{}) exceeds {elements} elements",
                    subset.name, subset.offset, subset.count
                ));
            }
            for lod in &subset.lods {
                if lod.offset as usize + lod.count as usize > elements {
                    return fail(format!(
                        "lod of subset '{}' [{}, +{}) exceeds {elements} elements",
                        subset.name, lod.offset, lod.count
                    ));
                }
            }
        }
        for (i, target) in self.morph_targets.iter().enumerate() {
            if target.positions.len() != n {
                return fail(format!(
                    "morph target {i} has {} positions for {n} vertices",
                    target.positions.len()
                ));
            }
            if !target.normals.is_empty() && target.normals.len() != n {
                return fail(format!(
                    "morph target {i} has {} normals for {n} vertices",
                    target.normals.len()
                ));
            }
        }
        Ok(())
    }

    /// Normal deltas are used only when the mesh has normals and every
    /// target that could carry them does.
    #[must_use]
    pub fn morph_layout(&self) -> MorphLayout {
        let targets = self.morph_targets.len().min(MAX_MORPH_TARGETS);
        let with_normals = !self.normals.is_empty()
            && self.morph_targets[..targets.min(MAX_MORPH_NORMALS)]
                .iter()
                .all(|t| !t.normals.is_empty());
        MorphLayout::new(targets, with_normals)
    }

    /// Subsets, synthesizing one over the whole mesh when none are declared.
    #[must_use]
    pub fn effective_subsets(&self) -> Vec<MeshSubset> {
        if self.subsets.is_empty() {
            vec![MeshSubset {
                name: String::new(),
                offset: 0,
                count: self.element_count() as u32,
                lods: Vec::new(),
            }]
        } else {
            self.subsets.clone()
        }
    }

    #[must_use]
    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.positions.iter().map(|&p| Vec3::from(p)))
    }

    /// Bounds of the vertices a subset references.
    #[must_use]
    pub fn subset_bounds(&self, subset: &MeshSubset) -> Aabb {
        let range = subset.offset as usize..(subset.offset + subset.count) as usize;
        if self.indices.is_empty() {
            Aabb::from_points(self.positions[range].iter().map(|&p| Vec3::from(p)))
        } else {
            Aabb::from_points(
                self.indices[range]
                    .iter()
                    .map(|&i| Vec3::from(self.positions[i as usize])),
            )
        }
    }

    /// Vertex layout matching [`interleave`](Self::interleave).
    #[must_use]
    pub fn vertex_layout(&self) -> VertexLayoutDesc {
        let mut layout = self.attributes().layout();
        self.morph_layout().extend(&mut layout);
        layout
    }

    /// Interleaves all present attributes into one byte buffer.
    #[must_use]
    pub fn interleave(&self) -> Vec<u8> {
        let stride = self.vertex_layout().stride as usize;
        let morph = self.morph_layout();
        let mut out = Vec::with_capacity(stride * self.positions.len());
        for i in 0..self.positions.len() {
            out.extend_from_slice(bytemuck::cast_slice(&self.positions[i]));
            if let Some(v) = self.normals.get(i) {
                out.extend_from_slice(bytemuck::cast_slice(v));
            }
            if let Some(v) = self.uv0.get(i) {
                out.extend_from_slice(bytemuck::cast_slice(v));
            }
            if let Some(v) = self.uv1.get(i) {
                out.extend_from_slice(bytemuck::cast_slice(v));
            }
            if let Some(v) = self.tangents.get(i) {
                out.extend_from_slice(bytemuck::cast_slice(v));
            }
            if let Some(v) = self.colors.get(i) {
                out.extend_from_slice(bytemuck::cast_slice(v));
            }
            if let Some(v) = self.joints.get(i) {
                out.extend_from_slice(bytemuck::cast_slice(v));
            }
            if let Some(v) = self.weights.get(i) {
                out.extend_from_slice(bytemuck::cast_slice(v));
            }
            let targets = &self.morph_targets[..morph.targets as usize];
            for target in targets {
                out.extend_from_slice(bytemuck::cast_slice(&target.positions[i]));
            }
            for target in &targets[..morph.normals as usize] {
                out.extend_from_slice(bytemuck::cast_slice(&target.normals[i]));
            }
        }
        out
    }

    /// CPU copy of the geometry for ray tests.
    #[must_use]
    pub fn pick_geometry(&self) -> PickGeometry {
        PickGeometry {
            positions: self.positions.iter().map(|&p| Vec3::from(p)).collect(),
            indices: self.indices.clone(),
        }
    }

    /// Index bytes, narrowed to `u16` when every index fits.
    #[must_use]
    pub fn index_bytes(&self) -> Option<(Vec<u8>, wgpu::IndexFormat)> {
        if self.indices.is_empty() {
            return None;
        }
        if self.positions.len() <= usize::from(u16::MAX) {
            let narrow: Vec<u16> = self.indices.iter().map(|&i| i as u16).collect();
            Some((bytemuck::cast_slice(&narrow).to_vec(), wgpu::IndexFormat::Uint16))
        } else {
            Some((
                bytemuck::cast_slice(&self.indices).to_vec(),
                wgpu::IndexFormat::Uint32,
            ))
        }
    }
}

// ============================================================================
// Bounds
// ============================================================================

/// Axis-aligned bounding box. An empty box has `min > max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |acc, p| Self {
            min: acc.min.min(p),
            max: acc.max.max(p),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Radius of the bounding sphere around [`center`](Self::center).
    #[must_use]
    pub fn radius(&self) -> f32 {
        self.half_extents().length()
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Corner farthest along `direction`.
    #[must_use]
    pub fn support(&self, direction: Vec3) -> Vec3 {
        Vec3::select(direction.cmpge(Vec3::ZERO), self.max, self.min)
    }

    /// Entry distance of a ray into the box (zero when it starts inside),
    /// or `None` on a miss.
    #[must_use]
    pub fn intersect_ray(&self, ray: &Ray) -> Option<f32> {
        if self.is_empty() {
            return None;
        }
        let mut t_min = 0.0_f32;
        let mut t_max = f32::INFINITY;
        for axis in 0..3 {
            let (o, d) = (ray.origin[axis], ray.direction[axis]);
            let (lo, hi) = (self.min[axis], self.max[axis]);
            if d.abs() < f32::EPSILON {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let (t0, t1) = ((lo - o) * inv, (hi - o) * inv);
            t_min = t_min.max(t0.min(t1));
            t_max = t_max.min(t0.max(t1));
            if t_min > t_max {
                return None;
            }
        }
        Some(t_min)
    }

    /// Bounds of the eight transformed corners.
    #[must_use]
    pub fn transformed(&self, m: &Affine3A) -> Self {
        if self.is_empty() {
            return *self;
        }
        Self::from_points((0..8).map(|i| {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            m.transform_point3(corner)
        }))
    }
}

// ============================================================================
// GPU mesh
// ============================================================================

#[derive(Debug, Clone)]
pub struct GpuSubset {
    pub name: String,
    pub offset: u32,
    pub count: u32,
    pub bounds: Aabb,
    pub lods: Vec<MeshLod>,
}

impl GpuSubset {
    /// Element range for a level of detail; 0 is the subset itself.
    #[must_use]
    pub fn range(&self, lod: usize) -> (u32, u32) {
        match lod.checked_sub(1).and_then(|i| self.lods.get(i)) {
            Some(l) => (l.offset, l.count),
            None => (self.offset, self.count),
        }
    }
}

/// Positions and indices kept on the CPU for picking.
#[derive(Debug, Clone, Default)]
pub struct PickGeometry {
    pub positions: Vec<Vec3>,
    /// Empty for non-indexed meshes.
    pub indices: Vec<u32>,
}

impl PickGeometry {
    /// Nearest triangle hit within an element range, as a ray parameter.
    /// Both faces count.
    #[must_use]
    pub fn intersect_ray(&self, ray: &Ray, offset: u32, count: u32) -> Option<f32> {
        let start = offset as usize;
        let end = start + count as usize;
        let vertex = |e: usize| -> Option<Vec3> {
            let i = if self.indices.is_empty() {
                e
            } else {
                *self.indices.get(e)? as usize
            };
            self.positions.get(i).copied()
        };
        let mut nearest: Option<f32> = None;
        for e in (start..end).step_by(3) {
            let (Some(a), Some(b), Some(c)) = (vertex(e), vertex(e + 1), vertex(e + 2)) else {
                break;
            };
            if let Some(t) = intersect_triangle(ray, a, b, c)
                && nearest.is_none_or(|n| t < n)
            {
                nearest = Some(t);
            }
        }
        nearest
    }
}

/// Moller-Trumbore.
fn intersect_triangle(ray: &Ray, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    const EPSILON: f32 = 1e-7;
    let e1 = b - a;
    let e2 = c - a;
    let p = ray.direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    let s = ray.origin - a;
    let u = s.dot(p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.direction.dot(q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv;
    (t >= 0.0).then_some(t)
}

/// A mesh resident on the GPU. A placeholder mesh has no buffers and is
/// never drawn.
#[derive(Debug, Clone)]
pub struct GpuMesh {
    pub vertex_buffer: Option<BufferId>,
    pub index_buffer: Option<(BufferId, wgpu::IndexFormat)>,
    pub vertex_count: u32,
    pub layout: VertexLayoutDesc,
    pub attributes: VertexAttributes,
    pub subsets: Vec<GpuSubset>,
    pub bounds: Aabb,
    pub morph: MorphLayout,
    pub pick: Option<Arc<PickGeometry>>,
    pub placeholder: bool,
}

impl GpuMesh {
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            vertex_buffer: None,
            index_buffer: None,
            vertex_count: 0,
            layout: VertexLayoutDesc::default(),
            attributes: VertexAttributes::empty(),
            subsets: Vec::new(),
            bounds: Aabb::EMPTY,
            morph: MorphLayout::default(),
            pick: None,
            placeholder: true,
        }
    }

    #[must_use]
    pub fn is_drawable(&self) -> bool {
        !self.placeholder && self.vertex_buffer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> MeshData {
        MeshData {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            uv0: vec![[0.0, 0.0]; 3],
            indices: vec![0, 1, 2],
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_catches_bad_indices() {
        let mut mesh = triangle();
        assert!(mesh.validate("tri").is_ok());
        mesh.indices = vec![0, 1, 7];
        assert!(matches!(
            mesh.validate("tri"),
            Err(LumenError::MalformedMesh { .. })
        ));
    }

    #[test]
    fn test_validate_catches_attribute_mismatch() {
        let mut mesh = triangle();
        mesh.normals = vec![[0.0, 0.0, 1.0]];
        assert!(mesh.validate("tri").is_err());
    }

    #[test]
    fn test_interleave_matches_layout() {
        let mesh = triangle();
        let layout = mesh.vertex_layout();
        assert_eq!(layout.stride, 20);
        assert_eq!(layout.attributes.len(), 2);
        assert_eq!(layout.attributes[1].location, 2);
        assert_eq!(mesh.interleave().len(), 60);
        let (bytes, format) = mesh.index_bytes().unwrap();
        assert_eq!(format, wgpu::IndexFormat::Uint16);
        assert_eq!(bytes.len(), 6);
    }

    #[test]
    fn test_aabb_transform() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let moved = aabb.transformed(&Affine3A::from_translation(Vec3::new(5.0, 0.0, 0.0)));
        assert_eq!(moved.center(), Vec3::new(5.0, 0.0, 0.0));
        assert!(Aabb::EMPTY.is_empty());
    }

    #[test]
    fn test_morph_layout_shares_eight_locations() {
        assert_eq!(MorphLayout::new(2, true), MorphLayout { targets: 2, normals: 2 });
        assert_eq!(MorphLayout::new(6, true), MorphLayout { targets: 6, normals: 2 });
        assert_eq!(MorphLayout::new(12, true), MorphLayout { targets: 8, normals: 0 });
        assert_eq!(MorphLayout::new(3, false).normals, 0);
    }

    #[test]
    fn test_morph_deltas_are_interleaved() {
        let mut mesh = triangle();
        mesh.morph_targets = vec![
            MorphTargetData {
                positions: vec![[0.0, 0.0, 1.0]; 3],
                normals: Vec::new(),
            };
            2
        ];
        assert!(mesh.validate("tri").is_ok());
        let layout = mesh.vertex_layout();
        assert_eq!(layout.stride, 20 + 24);
        assert_eq!(layout.attributes.last().unwrap().location, 9);
        assert_eq!(mesh.interleave().len(), 3 * 44);

        mesh.morph_targets[1].positions.pop();
        assert!(mesh.validate("tri").is_err());
    }

    #[test]
    fn test_lod_range_is_validated() {
        let mut mesh = triangle();
        mesh.subsets = vec![MeshSubset {
            name: "body".into(),
            offset: 0,
            count: 3,
            lods: vec![MeshLod {
                offset: 3,
                count: 3,
                distance: 1.0,
            }],
        }];
        assert!(mesh.validate("tri").is_err());
        mesh.subsets[0].lods[0].offset = 0;
        assert!(mesh.validate("tri").is_ok());
    }

    #[test]
    fn test_ray_hits_box_and_triangle() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let ray = Ray::new(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z);
        assert_eq!(aabb.intersect_ray(&ray), Some(4.0));
        let away = Ray::new(Vec3::new(0.0, 0.0, 5.0), Vec3::Z);
        assert_eq!(aabb.intersect_ray(&away), None);
        let inside = Ray::new(Vec3::ZERO, Vec3::X);
        assert_eq!(aabb.intersect_ray(&inside), Some(0.0));

        let geometry = triangle().pick_geometry();
        let hit = Ray::new(Vec3::new(0.25, 0.25, 2.0), Vec3::NEG_Z);
        let t = geometry.intersect_ray(&hit, 0, 3).unwrap();
        assert!((t - 2.0).abs() < 1e-5);
        let miss = Ray::new(Vec3::new(0.9, 0.9, 2.0), Vec3::NEG_Z);
        assert_eq!(geometry.intersect_ray(&miss, 0, 3), None);
        assert_eq!(geometry.intersect_ray(&hit, 0, 0), None);
    }
}
