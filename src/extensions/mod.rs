//! Render extensions.
//!
//! Third-party passes registered per layer. An extension declares where it
//! runs ([`RenderStage`]) and how ([`RenderMode`]), then follows the same
//! split as the renderer itself:
//!
//! | Phase | Called from | Pass open |
//! |-------|-------------|-----------|
//! | `prepare_data` | `prepare_layer_for_render` | no |
//! | `prepare_render` | `rhi_prepare` | no |
//! | `render` | `rhi_prepare` (Standalone) or `rhi_render` (Main) | Main only |
//! | `reset_for_frame` | outermost `begin_frame` | no |

use bitflags::bitflags;

use crate::errors::Result;
use crate::hal::{RenderBackend, TextureId};
use crate::scene::{Camera, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderStage {
    /// Before the layer's opaque objects.
    PreColor,
    /// After the layer's transparent objects.
    PostColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    /// Renders into its own targets during `rhi_prepare`.
    Standalone,
    /// Records into the layer's main pass.
    Main,
}

/// Intermediate textures an extension can ask the renderer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderResult {
    DepthTexture,
    AoTexture,
    ScreenTexture,
}

impl RenderResult {
    pub const ALL: [Self; 3] = [Self::DepthTexture, Self::AoTexture, Self::ScreenTexture];

    fn flag(self) -> RenderResults {
        match self {
            Self::DepthTexture => RenderResults::DEPTH,
            Self::AoTexture => RenderResults::AO,
            Self::ScreenTexture => RenderResults::SCREEN,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderResults: u8 {
        const DEPTH  = 1 << 0;
        const AO     = 1 << 1;
        const SCREEN = 1 << 2;
    }
}

/// Defines the snapshot struct with a getter and a `set_` method per field.
macro_rules! pipeline_state_snapshot {
    ($($(#[$meta:meta])* $field:ident: $ty:ty = $default:expr),* $(,)?) => {
        /// Pipeline state of the layer's main pass, as seen by extensions.
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct PipelineStateSnapshot {
            $( $(#[$meta])* $field: $ty, )*
        }

        impl Default for PipelineStateSnapshot {
            fn default() -> Self {
                Self { $( $field: $default, )* }
            }
        }

        impl PipelineStateSnapshot {
            $(
                #[must_use]
                pub fn $field(&self) -> $ty {
                    self.$field
                }

                paste::paste! {
                    pub fn [<set_ $field>](&mut self, value: $ty) {
                        self.$field = value;
                    }
                }
            )*
        }
    };
}

pipeline_state_snapshot! {
    /// x, y, width, height in pixels.
    viewport: [f32; 4] = [0.0; 4],
    depth_test: bool = true,
    depth_write: bool = true,
    cull_mode: Option<wgpu::Face> = Some(wgpu::Face::Back),
    blend: Option<wgpu::BlendState> = None,
    sample_count: u32 = 1,
    color_format: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb,
    depth_format: Option<wgpu::TextureFormat> = Some(wgpu::TextureFormat::Depth32Float),
}

/// Per-frame snapshot handed to extensions.
#[derive(Debug, Clone)]
pub struct FrameData {
    layer: NodeId,
    frame_index: u64,
    camera: Option<Camera>,
    camera_node: Option<NodeId>,
    pipeline_state: PipelineStateSnapshot,
    requested: RenderResults,
    results: [Option<TextureId>; 3],
}

impl FrameData {
    #[must_use]
    pub fn new(layer: NodeId) -> Self {
        Self {
            layer,
            frame_index: 0,
            camera: None,
            camera_node: None,
            pipeline_state: PipelineStateSnapshot::default(),
            requested: RenderResults::empty(),
            results: [None; 3],
        }
    }

    #[must_use]
    pub fn layer(&self) -> NodeId {
        self.layer
    }

    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// The layer's active camera, already updated for this frame.
    #[must_use]
    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    #[must_use]
    pub fn camera_node(&self) -> Option<NodeId> {
        self.camera_node
    }

    #[must_use]
    pub fn pipeline_state(&self) -> &PipelineStateSnapshot {
        &self.pipeline_state
    }

    /// Asks the renderer to produce `result` this frame. Only meaningful
    /// from `prepare_data`.
    pub fn request(&mut self, result: RenderResult) {
        self.requested |= result.flag();
    }

    #[must_use]
    pub fn is_requested(&self, result: RenderResult) -> bool {
        self.requested.contains(result.flag())
    }

    #[must_use]
    pub fn requested(&self) -> RenderResults {
        self.requested
    }

    /// Texture produced for `result`, once `rhi_prepare` has run.
    #[must_use]
    pub fn render_result(&self, result: RenderResult) -> Option<TextureId> {
        self.results[result.index()]
    }

    pub(crate) fn begin_frame(
        &mut self,
        frame_index: u64,
        camera: Option<(NodeId, Camera)>,
        pipeline_state: PipelineStateSnapshot,
    ) {
        self.frame_index = frame_index;
        (self.camera_node, self.camera) = match camera {
            Some((node, camera)) => (Some(node), Some(camera)),
            None => (None, None),
        };
        self.pipeline_state = pipeline_state;
        self.requested = RenderResults::empty();
        self.results = [None; 3];
    }

    pub(crate) fn set_render_result(&mut self, result: RenderResult, texture: TextureId) {
        self.results[result.index()] = Some(texture);
    }
}

/// A third-party pass.
pub trait RenderExtension {
    fn stage(&self) -> RenderStage;

    fn mode(&self) -> RenderMode;

    /// Inspects the frame and requests render results. Returns whether the
    /// extension has work this frame.
    fn prepare_data(&mut self, data: &mut FrameData) -> bool;

    /// Creates or updates GPU resources. No pass is open.
    fn prepare_render(&mut self, data: &FrameData, backend: &mut dyn RenderBackend) -> Result<()>;

    /// Records draws. For [`RenderMode::Main`] the layer's pass is open.
    fn render(&mut self, data: &FrameData, backend: &mut dyn RenderBackend) -> Result<()>;

    fn reset_for_frame(&mut self) {}

    /// Context teardown.
    fn release(&mut self, _backend: &mut dyn RenderBackend) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn layer_id() -> NodeId {
        let mut map: SlotMap<NodeId, ()> = SlotMap::with_key();
        map.insert(())
    }

    #[test]
    fn test_requests_reset_each_frame() {
        let mut data = FrameData::new(layer_id());
        data.request(RenderResult::DepthTexture);
        data.request(RenderResult::AoTexture);
        assert!(data.is_requested(RenderResult::DepthTexture));
        assert!(!data.is_requested(RenderResult::ScreenTexture));

        data.begin_frame(2, None, PipelineStateSnapshot::default());
        assert_eq!(data.requested(), RenderResults::empty());
        assert_eq!(data.frame_index(), 2);
        assert!(data.camera().is_none());
    }

    #[test]
    fn test_snapshot_accessors() {
        let mut state = PipelineStateSnapshot::default();
        assert!(state.depth_test());
        state.set_depth_write(false);
        state.set_viewport([0.0, 0.0, 640.0, 480.0]);
        assert!(!state.depth_write());
        assert_eq!(state.viewport()[2], 640.0);
    }
}
