//! Scene Graph Node Model
//!
//! Passive scene data with dirty-flag bookkeeping:
//! - [`Node`]: hierarchy, local/global values, dirty flags, typed payload
//! - [`SceneGraph`]: arenas for nodes, materials, images, data, effects
//! - [`hierarchy`]: the global-values pass that clears node flags
//! - [`Material`], [`Image`], [`Light`], [`Camera`], [`Layer`], [`Model`]
//! - [`SpatialNodeProxy`]: front-end sync boundary

pub mod camera;
pub mod effect;
pub mod graph;
pub mod hierarchy;
pub mod image;
pub mod layer;
pub mod light;
pub mod material;
pub mod model;
pub mod node;
pub mod sync;
pub mod tracking;
pub mod transform;

pub use camera::{Camera, Frustum, ProjectionType, Ray};
pub use effect::{Effect, EffectCommand, EffectShader};
pub use graph::{Geometry, SceneGraph, TextureData};
pub use image::{Image, ImageFlags, MappingMode, TextureSource, Tiling};
pub use layer::Layer;
pub use light::{Light, LightKind};
pub use material::{
    AlphaMode, CullMode, CustomMaterial, DefaultParams, MapSlot, Material, MaterialDirty,
    MaterialKind, MaterialUniforms, PrincipledParams, ShadingMode, SpecularModel, TextureChannel,
    TextureMapSlot, UniformValue, MAP_SLOT_COUNT, pack_uniforms, packed_uniform_size,
};
pub use model::{Item2D, MeshSource, Model, Particles, ReflectionProbe, ReflectionRefreshMode};
pub use node::{Node, NodeFlags, NodeKind};
pub use sync::SpatialNodeProxy;
pub use tracking::{DirtyGuard, VersionGuard};
pub use transform::Transform;

use slotmap::new_key_type;

new_key_type! {
    pub struct NodeId;
    pub struct MaterialId;
    pub struct ImageId;
    pub struct TextureDataId;
    pub struct GeometryId;
    pub struct EffectId;
}
