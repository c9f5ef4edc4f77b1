//! Effect / Post-processing Pass System
//!
//! Runs a layer's effect chain over its rendered color output. Effects
//! execute last-added first; each effect's output is the next one's input.
//!
//! An effect is a command list interpreted against a small state machine:
//!
//! ```text
//! AllocateBuffer ─► named intermediate from the pool
//! BindTarget / BindBuffer ─► render target
//! BindShader ─► selects source, resets applied values
//! Apply* ─► uniform values and texture inputs
//! Render ─► one fullscreen triangle
//! ```
//!
//! Intermediate textures come from [`EffectTexturePool`] and are released
//! when the effect finishes; the pool decides at frame end what to free.

pub mod pool;

pub use pool::EffectTexturePool;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use crate::errors::Result;
use crate::hal::{
    BindGroupDesc, BindGroupId, BindingResource, BufferDesc, BufferId, RenderBackend,
    RenderPassDesc, TextureId,
};
use crate::renderer::uniforms::effect_uniform_bytes;
use crate::scene::{Effect, EffectCommand, UniformValue};
use crate::shader::ShaderCache;
use crate::shader::cache::PipelineStateKey;
use crate::shader::generator::fullscreen_texture_binding;

/// Borrowed context for one [`EffectSystem::process`] call.
pub struct EffectContext<'a> {
    pub backend: &'a mut dyn RenderBackend,
    pub shaders: &'a mut ShaderCache,
    pub pool: &'a mut EffectTexturePool,
}

/// Executes effect chains and owns the per-frame GPU objects they need.
#[derive(Default)]
pub struct EffectSystem {
    /// Registered source name to code hash.
    registered: FxHashMap<String, u64>,
    /// Uniform buffers reused by pass index across frames.
    uniform_buffers: Vec<(BufferId, u64)>,
    buffers_used: usize,
    /// Bind groups live until the frame is submitted.
    frame_bind_groups: Vec<BindGroupId>,
    passes_rendered: u32,
}

/// Mutable state while one effect's commands run.
struct EffectRun {
    input: TextureId,
    output: Option<TextureId>,
    target: Option<TextureId>,
    shader: Option<String>,
    values: Vec<(String, UniformValue)>,
    textures: SmallVec<[(String, TextureId); 4]>,
    buffers: FxHashMap<String, TextureId>,
    acquired: SmallVec<[TextureId; 4]>,
}

impl EffectRun {
    fn new(input: TextureId) -> Self {
        Self {
            input,
            output: None,
            target: None,
            shader: None,
            values: Vec::new(),
            textures: SmallVec::new(),
            buffers: FxHashMap::default(),
            acquired: SmallVec::new(),
        }
    }

    fn set_value(&mut self, name: &str, value: UniformValue) {
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name.to_owned(), value)),
        }
    }

    fn set_texture(&mut self, param: &str, texture: TextureId) {
        match self.textures.iter_mut().find(|(n, _)| n == param) {
            Some(slot) => slot.1 = texture,
            None => self.textures.push((param.to_owned(), texture)),
        }
    }
}

impl EffectSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `effects` (insertion order) over `input_color` and returns the
    /// final output. With no effects the input is returned unchanged.
    ///
    /// The returned texture holds one pool reference when it differs from
    /// the input; the caller releases it once it has been consumed.
    pub fn process(
        &mut self,
        ctx: &mut EffectContext<'_>,
        effects: &[&Effect],
        input_color: TextureId,
        input_depth: Option<TextureId>,
        size: (u32, u32),
    ) -> Result<TextureId> {
        let mut current = input_color;
        for effect in effects.iter().rev() {
            let output = self.run_effect(ctx, effect, current, input_depth, size)?;
            if current != input_color && current != output {
                ctx.pool.release(current);
            }
            current = output;
        }
        Ok(current)
    }

    /// Number of fullscreen passes issued since the last frame boundary.
    #[must_use]
    pub fn passes_rendered(&self) -> u32 {
        self.passes_rendered
    }

    /// Frame boundary, after submission: destroys this frame's bind groups.
    pub fn end_frame(&mut self, backend: &mut dyn RenderBackend) {
        for group in self.frame_bind_groups.drain(..) {
            backend.destroy_bind_group(group);
        }
        self.buffers_used = 0;
        self.passes_rendered = 0;
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.end_frame(backend);
        for (buffer, _) in self.uniform_buffers.drain(..) {
            backend.destroy_buffer(buffer);
        }
        self.registered.clear();
    }

    fn run_effect(
        &mut self,
        ctx: &mut EffectContext<'_>,
        effect: &Effect,
        input: TextureId,
        input_depth: Option<TextureId>,
        size: (u32, u32),
    ) -> Result<TextureId> {
        log::trace!("Running effect {}", effect.name);
        let input_format = ctx
            .backend
            .texture_desc(input)
            .map_or(wgpu::TextureFormat::Rgba8Unorm, |d| d.format);
        let mut run = EffectRun::new(input);

        let result = self.execute_commands(ctx, effect, &mut run, input_depth, size, input_format);

        // Intermediates go back to the pool even when a command failed.
        for texture in run.acquired.drain(..) {
            ctx.pool.release(texture);
        }
        if let Err(err) = result {
            if let Some(output) = run.output {
                ctx.pool.release(output);
            }
            return Err(err);
        }

        match run.output {
            Some(output) => Ok(output),
            None => {
                log::warn!("Effect {} never bound an output; passing input through", effect.name);
                Ok(input)
            }
        }
    }

    fn execute_commands(
        &mut self,
        ctx: &mut EffectContext<'_>,
        effect: &Effect,
        run: &mut EffectRun,
        input_depth: Option<TextureId>,
        size: (u32, u32),
        input_format: wgpu::TextureFormat,
    ) -> Result<()> {
        for command in &effect.commands {
            match command {
                EffectCommand::AllocateBuffer {
                    name,
                    format,
                    size_multiplier,
                    scene_lifetime,
                } => {
                    if run.buffers.contains_key(name) {
                        continue;
                    }
                    let buffer_size = EffectTexturePool::scaled_size(size, *size_multiplier);
                    let texture = ctx.pool.acquire_with_lifetime(
                        ctx.backend,
                        &format!("{}/{name}", effect.name),
                        buffer_size,
                        format.unwrap_or(input_format),
                        *scene_lifetime,
                    )?;
                    run.buffers.insert(name.clone(), texture);
                    run.acquired.push(texture);
                }
                EffectCommand::BindTarget { format } => {
                    let output = match run.output {
                        Some(output) => output,
                        None => {
                            let output = ctx.pool.acquire(
                                ctx.backend,
                                &format!("{}/output", effect.name),
                                size,
                                format.unwrap_or(input_format),
                            )?;
                            run.output = Some(output);
                            output
                        }
                    };
                    run.target = Some(output);
                }
                EffectCommand::BindBuffer { name } => match run.buffers.get(name) {
                    Some(&texture) => run.target = Some(texture),
                    None => log::warn!("Effect {}: unknown buffer {name}", effect.name),
                },
                EffectCommand::BindShader { shader } => {
                    let Some(source) = effect.shader(shader) else {
                        log::warn!("Effect {}: unknown shader {shader}", effect.name);
                        run.shader = None;
                        continue;
                    };
                    let source_name = format!("{}/{}", effect.name, source.name);
                    self.register(ctx, &source_name, &source.code)?;
                    run.shader = Some(source_name);
                    run.values.clear();
                    run.textures.clear();
                }
                EffectCommand::ApplyInstanceValue { property } => match property {
                    Some(name) => match effect.property(name) {
                        Some(value) => run.set_value(name, *value),
                        None => log::warn!("Effect {}: unknown property {name}", effect.name),
                    },
                    None => {
                        for (name, value) in &effect.properties {
                            run.set_value(name, *value);
                        }
                    }
                },
                EffectCommand::ApplyValue { name, value } => run.set_value(name, *value),
                EffectCommand::ApplyBufferValue { buffer, param } => {
                    let texture = match buffer {
                        None => Some(run.input),
                        Some(name) => run.buffers.get(name).copied(),
                    };
                    match texture {
                        Some(texture) => run.set_texture(param, texture),
                        None => log::warn!("Effect {}: unknown buffer for {param}", effect.name),
                    }
                }
                EffectCommand::ApplyDepthValue { param } => match input_depth {
                    Some(depth) => run.set_texture(param, depth),
                    None => log::warn!("Effect {}: no depth texture for {param}", effect.name),
                },
                EffectCommand::Render { needs_clear } => {
                    self.render_pass(ctx, effect, run, *needs_clear)?;
                }
            }
        }
        Ok(())
    }

    fn register(&mut self, ctx: &mut EffectContext<'_>, name: &str, code: &str) -> Result<()> {
        let hash = xxh3_64(code.as_bytes());
        if self.registered.get(name) == Some(&hash) {
            return Ok(());
        }
        ctx.shaders.register_source(ctx.backend, name, code)?;
        self.registered.insert(name.to_owned(), hash);
        Ok(())
    }

    fn render_pass(
        &mut self,
        ctx: &mut EffectContext<'_>,
        effect: &Effect,
        run: &EffectRun,
        needs_clear: bool,
    ) -> Result<()> {
        let (Some(target), Some(shader)) = (run.target, run.shader.as_deref()) else {
            log::warn!("Effect {}: render without target or shader skipped", effect.name);
            return Ok(());
        };
        if run.textures.iter().any(|(_, t)| *t == target) {
            log::warn!("Effect {}: target is also sampled, pass skipped", effect.name);
            return Ok(());
        }
        let Some(desc) = ctx.backend.texture_desc(target) else {
            log::warn!("Effect {}: target texture is gone", effect.name);
            return Ok(());
        };
        let (format, target_size) = (desc.format, (desc.width, desc.height));

        let names: SmallVec<[&str; 4]> = run.textures.iter().map(|(n, _)| n.as_str()).collect();
        let pipeline = ctx.shaders.get_or_create_fullscreen(
            ctx.backend,
            Some(shader),
            &run.values,
            &names,
            PipelineStateKey::fullscreen(format),
        )?;

        let bytes = effect_uniform_bytes(target_size, &run.values);
        let uniforms = self.uniform_buffer(ctx.backend, &bytes)?;

        let mut entries: SmallVec<[(u32, BindingResource); 9]> = SmallVec::new();
        entries.push((
            0,
            BindingResource::Buffer {
                buffer: uniforms,
                offset: 0,
                size: Some(bytes.len() as u64),
            },
        ));
        for (i, (_, texture)) in run.textures.iter().enumerate() {
            let binding = fullscreen_texture_binding(i);
            entries.push((binding, BindingResource::Texture(*texture)));
            entries.push((
                binding + 1,
                BindingResource::Sampler {
                    filter: wgpu::FilterMode::Linear,
                    address: wgpu::AddressMode::ClampToEdge,
                },
            ));
        }
        let group = ctx.backend.create_bind_group(&BindGroupDesc {
            label: "lumen.effect",
            pipeline,
            group: 0,
            entries: &entries,
        })?;
        self.frame_bind_groups.push(group);

        let clear = needs_clear.then_some(wgpu::Color::TRANSPARENT);
        ctx.backend
            .begin_render_pass(&RenderPassDesc::single("lumen.effect", target, clear, None))?;
        let drawn = ctx
            .backend
            .set_pipeline(pipeline)
            .and_then(|()| ctx.backend.set_bind_group(0, group, &[]))
            .and_then(|()| ctx.backend.draw(0..3, 0..1));
        // The pass is closed even when recording failed.
        let ended = ctx.backend.end_render_pass();
        drawn?;
        ended?;

        self.passes_rendered += 1;
        Ok(())
    }

    /// Next uniform buffer for this frame, grown when too small.
    fn uniform_buffer(&mut self, backend: &mut dyn RenderBackend, bytes: &[u8]) -> Result<BufferId> {
        let index = self.buffers_used;
        let needed = bytes.len() as u64;
        self.buffers_used += 1;

        if let Some(&(buffer, capacity)) = self.uniform_buffers.get(index)
            && capacity >= needed
        {
            backend.write_buffer(buffer, 0, bytes)?;
            return Ok(buffer);
        }

        let capacity = needed.next_power_of_two().max(64);
        let buffer = backend.create_buffer(
            &BufferDesc {
                label: "lumen.effect.uniforms",
                size: capacity,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            },
            None,
        )?;
        backend.write_buffer(buffer, 0, bytes)?;
        if let Some(slot) = self.uniform_buffers.get_mut(index) {
            backend.destroy_buffer(slot.0);
            *slot = (buffer, capacity);
        } else {
            self.uniform_buffers.push((buffer, capacity));
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BackendCommand, HeadlessBackend, TextureDesc};

    const INVERT: &str = "fn effect_main(uv: vec2<f32>) -> vec4<f32> {\n    \
        let c = textureSample(input_texture, input_texture_sampler, uv);\n    \
        return vec4<f32>(1.0 - c.rgb, c.a);\n}\n";

    fn input(backend: &mut HeadlessBackend) -> TextureId {
        backend
            .create_texture(&TextureDesc::d2(
                "input",
                64,
                64,
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            ))
            .unwrap()
    }

    #[test]
    fn test_no_effects_passes_input_through() {
        let mut backend = HeadlessBackend::new();
        let mut shaders = ShaderCache::new();
        let mut pool = EffectTexturePool::new(1);
        let mut system = EffectSystem::new();
        let color = input(&mut backend);

        let mut ctx = EffectContext {
            backend: &mut backend,
            shaders: &mut shaders,
            pool: &mut pool,
        };
        let out = system.process(&mut ctx, &[], color, None, (64, 64)).unwrap();
        assert_eq!(out, color);
        assert_eq!(system.passes_rendered(), 0);
    }

    #[test]
    fn test_single_pass_renders_into_pooled_output() {
        let mut backend = HeadlessBackend::new();
        let mut shaders = ShaderCache::new();
        let mut pool = EffectTexturePool::new(1);
        let mut system = EffectSystem::new();
        let color = input(&mut backend);
        let effect = Effect::single_pass("invert", INVERT).with_property("amount", UniformValue::Float(1.0));

        let mut ctx = EffectContext {
            backend: &mut backend,
            shaders: &mut shaders,
            pool: &mut pool,
        };
        let out = system.process(&mut ctx, &[&effect], color, None, (64, 64)).unwrap();
        assert_ne!(out, color);
        assert!(pool.contains(out));
        assert_eq!(pool.refcount(out), Some(1));
        assert_eq!(system.passes_rendered(), 1);
        assert_eq!(backend.draw_count(), 1);
    }

    #[test]
    fn test_chain_runs_last_added_first() {
        let mut backend = HeadlessBackend::new();
        let mut shaders = ShaderCache::new();
        let mut pool = EffectTexturePool::new(1);
        let mut system = EffectSystem::new();
        let color = input(&mut backend);
        let first = Effect::single_pass("first", INVERT);
        let second = Effect::single_pass("second", INVERT);

        let mut ctx = EffectContext {
            backend: &mut backend,
            shaders: &mut shaders,
            pool: &mut pool,
        };
        let out = system
            .process(&mut ctx, &[&first, &second], color, None, (64, 64))
            .unwrap();

        let labels: Vec<_> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                BackendCommand::SetPipeline(id) => backend.pipeline_label(*id),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec!["second/second", "first/first"]);

        // Only the final output is still referenced.
        assert_eq!(pool.refcount(out), Some(1));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_intermediate_buffers_released() {
        let mut backend = HeadlessBackend::new();
        let mut shaders = ShaderCache::new();
        let mut pool = EffectTexturePool::new(1);
        let mut system = EffectSystem::new();
        let color = input(&mut backend);

        let mut effect = Effect::new("blur");
        effect.shaders.push(crate::scene::EffectShader {
            name: "pass".into(),
            code: INVERT.into(),
        });
        effect.commands = vec![
            EffectCommand::AllocateBuffer {
                name: "half".into(),
                format: None,
                size_multiplier: 0.5,
                scene_lifetime: false,
            },
            EffectCommand::BindBuffer { name: "half".into() },
            EffectCommand::BindShader { shader: "pass".into() },
            EffectCommand::ApplyBufferValue {
                buffer: None,
                param: "input_texture".into(),
            },
            EffectCommand::Render { needs_clear: true },
            EffectCommand::BindTarget { format: None },
            EffectCommand::ApplyBufferValue {
                buffer: Some("half".into()),
                param: "input_texture".into(),
            },
            EffectCommand::Render { needs_clear: false },
        ];

        let mut ctx = EffectContext {
            backend: &mut backend,
            shaders: &mut shaders,
            pool: &mut pool,
        };
        let out = system.process(&mut ctx, &[&effect], color, None, (64, 64)).unwrap();
        assert_eq!(system.passes_rendered(), 2);
        assert_eq!(pool.len(), 2);

        let half = backend
            .commands()
            .iter()
            .find_map(|c| match c {
                BackendCommand::BeginPass { desc, .. } => Some(desc.color_attachments[0].texture),
                _ => None,
            })
            .unwrap();
        assert_eq!(backend.texture_desc(half).map(|d| d.width), Some(32));
        assert_eq!(pool.refcount(half), Some(0));
        assert_eq!(pool.refcount(out), Some(1));
    }

    #[test]
    fn test_missing_shader_skips_render() {
        let mut backend = HeadlessBackend::new();
        let mut shaders = ShaderCache::new();
        let mut pool = EffectTexturePool::new(1);
        let mut system = EffectSystem::new();
        let color = input(&mut backend);

        let mut effect = Effect::single_pass("broken", INVERT);
        effect.shaders.clear();

        let mut ctx = EffectContext {
            backend: &mut backend,
            shaders: &mut shaders,
            pool: &mut pool,
        };
        system.process(&mut ctx, &[&effect], color, None, (64, 64)).unwrap();
        assert_eq!(system.passes_rendered(), 0);
        assert_eq!(backend.draw_count(), 0);
    }

    #[test]
    fn test_end_frame_destroys_bind_groups() {
        let mut backend = HeadlessBackend::new();
        let mut shaders = ShaderCache::new();
        let mut pool = EffectTexturePool::new(1);
        let mut system = EffectSystem::new();
        let color = input(&mut backend);
        let effect = Effect::single_pass("invert", INVERT);

        let mut ctx = EffectContext {
            backend: &mut backend,
            shaders: &mut shaders,
            pool: &mut pool,
        };
        system.process(&mut ctx, &[&effect], color, None, (64, 64)).unwrap();
        assert_eq!(system.frame_bind_groups.len(), 1);
        system.end_frame(&mut backend);
        assert!(system.frame_bind_groups.is_empty());
        assert_eq!(system.passes_rendered(), 0);
    }
}
