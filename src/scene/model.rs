use glam::{Vec2, Vec3, Vec4};
use smallvec::SmallVec;

use super::{GeometryId, ImageId, MaterialId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum MeshSource {
    /// File path or a built-in primitive such as `#Cube`.
    Path(String),
    /// Inline geometry owned by the scene.
    Geometry(GeometryId),
    #[default]
    None,
}

/// A drawable: mesh plus one material per mesh subset.
///
/// When the mesh has more subsets than materials the last material is
/// reused; a model with no materials draws with the default material.
#[derive(Debug, Clone)]
pub struct Model {
    pub mesh: MeshSource,
    pub materials: SmallVec<[MaterialId; 2]>,
    pub cast_shadows: bool,
    pub receive_shadows: bool,
    /// Lights that must not affect this object.
    pub excluded_lights: SmallVec<[NodeId; 2]>,
    pub instance_count: u32,
    pub bone_count: u32,
    /// Added to the camera-space depth used for sorting.
    pub depth_bias: f32,
    /// Larger values switch to coarser levels of detail sooner; zero or
    /// less always draws full detail.
    pub lod_bias: f32,
    /// One weight per morph target of the mesh; missing entries are zero.
    pub morph_weights: SmallVec<[f32; 8]>,
}

impl Model {
    #[must_use]
    pub fn new(mesh: MeshSource) -> Self {
        Self {
            mesh,
            materials: SmallVec::new(),
            cast_shadows: true,
            receive_shadows: true,
            excluded_lights: SmallVec::new(),
            instance_count: 1,
            bone_count: 0,
            depth_bias: 0.0,
            lod_bias: 1.0,
            morph_weights: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn with_material(mut self, material: MaterialId) -> Self {
        self.materials.push(material);
        self
    }

    #[must_use]
    pub fn with_cast_shadows(mut self, cast: bool) -> Self {
        self.cast_shadows = cast;
        self
    }

    /// Material for subset `index`.
    #[must_use]
    pub fn material_for_subset(&self, index: usize) -> Option<MaterialId> {
        self.materials
            .get(index)
            .or_else(|| self.materials.last())
            .copied()
    }
}

/// Instanced billboard particles. Simulation lives in the front end; the
/// core only sees the current particle count.
#[derive(Debug, Clone)]
pub struct Particles {
    pub model: Model,
    pub particle_count: u32,
    pub sprite: Option<ImageId>,
}

impl Particles {
    #[must_use]
    pub fn new(material: MaterialId, particle_count: u32) -> Self {
        let mut model = Model::new(MeshSource::Path("#Rectangle".into())).with_material(material);
        model.cast_shadows = false;
        model.instance_count = particle_count;
        Self {
            model,
            particle_count,
            sprite: None,
        }
    }
}

/// 2D content placed in the scene as a textured quad.
#[derive(Debug, Clone)]
pub struct Item2D {
    pub model: Model,
    pub size: Vec2,
    pub content: Option<ImageId>,
}

impl Item2D {
    #[must_use]
    pub fn new(material: MaterialId, size: Vec2) -> Self {
        let mut model = Model::new(MeshSource::Path("#Rectangle".into())).with_material(material);
        model.cast_shadows = false;
        model.receive_shadows = false;
        Self {
            model,
            size,
            content: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReflectionRefreshMode {
    #[default]
    FirstFrame,
    EveryFrame,
}

/// A box-shaped reflection probe. Objects inside the box use its cube map.
#[derive(Debug, Clone)]
pub struct ReflectionProbe {
    pub box_size: Vec3,
    pub refresh: ReflectionRefreshMode,
    pub resolution: u32,
    pub clear_color: Vec4,
    pub parallax_correction: bool,
}

impl Default for ReflectionProbe {
    fn default() -> Self {
        Self {
            box_size: Vec3::splat(10.0),
            refresh: ReflectionRefreshMode::FirstFrame,
            resolution: 256,
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            parallax_correction: false,
        }
    }
}

impl ReflectionProbe {
    /// Whether `point` lies in the probe box centred at `center`.
    #[must_use]
    pub fn contains(&self, center: Vec3, point: Vec3) -> bool {
        let half = self.box_size * 0.5;
        (point - center).abs().cmple(half).all()
    }
}
