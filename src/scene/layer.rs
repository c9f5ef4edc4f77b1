use glam::Vec4;

use super::{EffectId, ImageId, NodeId};
use crate::settings::TonemapMode;

/// Root of a renderable scene slice.
///
/// Effects are kept in insertion order and rendered in reverse: the last
/// added effect runs first on the layer output.
#[derive(Debug, Clone)]
pub struct Layer {
    pub explicit_camera: Option<NodeId>,
    /// `None` keeps the target contents.
    pub clear_color: Option<Vec4>,
    pub(crate) effects: Vec<EffectId>,
    pub(crate) imported_scene: Option<NodeId>,
    pub light_probe: Option<ImageId>,
    /// `None` uses the renderer setting.
    pub tonemap_mode: Option<TonemapMode>,

    pub fog: bool,
    /// Fog color; alpha scales the fog amount.
    pub fog_color: Vec4,
    /// Camera distance where fog starts and where it is full.
    pub fog_range: (f32, f32),
    pub ssao: bool,
    pub depth_pre_pass: bool,
    pub visible: bool,
}

impl Layer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            explicit_camera: None,
            clear_color: Some(Vec4::new(0.0, 0.0, 0.0, 1.0)),
            effects: Vec::new(),
            imported_scene: None,
            light_probe: None,
            tonemap_mode: None,
            fog: false,
            fog_color: Vec4::new(0.7, 0.7, 0.75, 1.0),
            fog_range: (10.0, 100.0),
            ssao: false,
            depth_pre_pass: false,
            visible: true,
        }
    }

    /// Effects in insertion order.
    #[must_use]
    pub fn effects(&self) -> &[EffectId] {
        &self.effects
    }

    /// Effects in execution order.
    pub fn effects_in_render_order(&self) -> impl Iterator<Item = EffectId> + '_ {
        self.effects.iter().rev().copied()
    }

    #[must_use]
    pub fn imported_scene(&self) -> Option<NodeId> {
        self.imported_scene
    }
}

impl Default for Layer {
    fn default() -> Self {
        Self::new()
    }
}
