//! Shader Key & Variant Resolver
//!
//! - [`key`]: the packed [`ShaderKey`] and its resolver
//! - [`generator`]: WGSL generation from embedded `minijinja` templates
//! - [`cache`]: pipeline and shader-module cache keyed by variant

pub mod cache;
pub mod generator;
pub mod key;

pub use cache::{BlendStateKey, PipelineStateKey, ShaderCache, ShaderCacheStats, VariantKey};
pub use generator::{DepthOutput, MaterialBindingLayout, ShaderGenerator};
pub use key::{
    LayerKeyState, LightKeyState, MapKeyState, ObjectKeyState, ShaderFeatures, ShaderKey,
    ShaderKeyProperties, ShaderKeyResolver,
};

/// Template and source names known before any runtime registration.
pub const BUILTIN_SHADERS: &[&str] = &[
    "material",
    "depth",
    "fullscreen",
    cache::PRINCIPLED_SOURCE,
    cache::SPECULAR_GLOSSY_SOURCE,
    cache::BLIT_SOURCE,
];
