//! Effect data.
//!
//! An effect is a small program of [`EffectCommand`]s executed by
//! [`EffectSystem`](crate::effects::EffectSystem). The scene only stores it.

use super::material::UniformValue;

#[derive(Debug, Clone, PartialEq)]
pub enum EffectCommand {
    /// Allocates a named intermediate texture for this effect.
    AllocateBuffer {
        name: String,
        /// `None` uses the input color format.
        format: Option<wgpu::TextureFormat>,
        size_multiplier: f32,
        /// Survives past the end of the frame.
        scene_lifetime: bool,
    },
    /// Renders into the effect output, allocating it on first use.
    BindTarget { format: Option<wgpu::TextureFormat> },
    /// Renders into a previously allocated buffer.
    BindBuffer { name: String },
    /// Selects a shader by source name.
    BindShader { shader: String },
    /// Applies one effect property, or all of them when `property` is `None`.
    ApplyInstanceValue { property: Option<String> },
    ApplyValue { name: String, value: UniformValue },
    /// Binds a texture to `param`: a named buffer, or the effect input when
    /// `buffer` is `None`.
    ApplyBufferValue { buffer: Option<String>, param: String },
    ApplyDepthValue { param: String },
    Render { needs_clear: bool },
}

/// Fragment source of an effect pass. `code` must define
/// `fn effect_main(uv: vec2<f32>) -> vec4<f32>`.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectShader {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    pub name: String,
    pub commands: Vec<EffectCommand>,
    pub properties: Vec<(String, UniformValue)>,
    pub shaders: Vec<EffectShader>,
}

impl Effect {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            properties: Vec::new(),
            shaders: Vec::new(),
        }
    }

    /// A single-pass effect: bind output, bind shader, apply input and
    /// all properties, render.
    #[must_use]
    pub fn single_pass(name: impl Into<String>, code: impl Into<String>) -> Self {
        let name = name.into();
        let mut effect = Self::new(name.clone());
        effect.shaders.push(EffectShader {
            name: name.clone(),
            code: code.into(),
        });
        effect.commands = vec![
            EffectCommand::BindTarget { format: None },
            EffectCommand::BindShader { shader: name },
            EffectCommand::ApplyBufferValue {
                buffer: None,
                param: "input_texture".into(),
            },
            EffectCommand::ApplyInstanceValue { property: None },
            EffectCommand::Render { needs_clear: false },
        ];
        effect
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: UniformValue) -> Self {
        self.properties.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn shader(&self, name: &str) -> Option<&EffectShader> {
        self.shaders.iter().find(|s| s.name == name)
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&UniformValue> {
        self.properties
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }
}
