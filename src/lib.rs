#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod arena;
pub mod effects;
pub mod errors;
pub mod extensions;
pub mod hal;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod settings;
pub mod shader;
pub mod utils;

pub use errors::{LumenError, Result};
pub use hal::{HeadlessBackend, RenderBackend};
pub use renderer::{RenderContext, Renderer};
pub use resources::{BufferManager, MemoryAssetProvider};
pub use scene::{Camera, Layer, Light, Material, Node, NodeId, NodeKind, SceneGraph};
pub use settings::RendererSettings;
pub use utils::interner;
