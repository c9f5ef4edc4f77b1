//! Screen-space ambient occlusion, expressed as a built-in effect over the
//! layer's linear depth texture.

use crate::scene::{Effect, EffectCommand, EffectShader, UniformValue};

pub(crate) const SSAO_EFFECT: &str = "lumen.ssao";

const SSAO_WGSL: &str = r"
fn effect_main(uv: vec2<f32>) -> vec4<f32> {
    let center = textureSampleLevel(depth_texture, depth_texture_sampler, uv, 0.0).r;
    var occlusion = 0.0;
    for (var i = 0; i < 8; i = i + 1) {
        let angle = f32(i) * 0.7853982;
        let offset = vec2<f32>(cos(angle), sin(angle)) * effect.radius * effect.texel_size.xy;
        let depth = textureSampleLevel(depth_texture, depth_texture_sampler, uv + offset, 0.0).r;
        let delta = center - depth;
        let range_check = smoothstep(0.0, 1.0, effect.distance / max(abs(delta), 0.0001));
        occlusion = occlusion + select(0.0, 1.0, delta > effect.bias) * range_check;
    }
    let ao = clamp(1.0 - effect.strength * occlusion / 8.0, 0.0, 1.0);
    return vec4<f32>(ao, ao, ao, 1.0);
}
";

/// The AO pass: one 8-bit target, depth in, occlusion factor out.
pub(crate) fn ssao_effect() -> Effect {
    let mut effect = Effect::new(SSAO_EFFECT)
        .with_property("radius", UniformValue::Float(4.0))
        .with_property("strength", UniformValue::Float(1.0))
        .with_property("distance", UniformValue::Float(0.02))
        .with_property("bias", UniformValue::Float(0.001));
    effect.shaders.push(EffectShader {
        name: "ssao".into(),
        code: SSAO_WGSL.into(),
    });
    effect.commands = vec![
        EffectCommand::BindTarget {
            format: Some(wgpu::TextureFormat::Rgba8Unorm),
        },
        EffectCommand::BindShader {
            shader: "ssao".into(),
        },
        EffectCommand::ApplyBufferValue {
            buffer: None,
            param: "depth_texture".into(),
        },
        EffectCommand::ApplyInstanceValue { property: None },
        EffectCommand::Render { needs_clear: false },
    ];
    effect
}
