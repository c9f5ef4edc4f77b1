//! Effect Texture Pool
//!
//! Intermediate textures requested by effects, keyed by
//! `(name, width, height, format)`.
//!
//! ```text
//! acquire()   refcount += 1, requested this frame
//! release()   refcount -= 1 (texture stays pooled)
//! end_frame() destroy: refcount == 0, not requested, idle too long
//! ```
//!
//! Released textures are not freed immediately; an effect that asks for
//! the same key next frame gets the same texture back.

use rustc_hash::FxHashMap;

use crate::errors::Result;
use crate::hal::{RenderBackend, TextureDesc, TextureId};
use crate::utils::interner::{self, Symbol};
use crate::utils::next_multiple_of_4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct PoolKey {
    name: Symbol,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
}

#[derive(Debug)]
struct PooledTexture {
    key: PoolKey,
    id: TextureId,
    refcount: u32,
    requested: bool,
    scene_lifetime: bool,
    /// Consecutive frames without a request.
    idle_frames: u32,
}

/// Refcounted texture pool for effect intermediates.
pub struct EffectTexturePool {
    textures: Vec<PooledTexture>,
    by_id: FxHashMap<TextureId, usize>,
    max_idle_frames: u32,
    created: u64,
}

impl EffectTexturePool {
    #[must_use]
    pub fn new(max_idle_frames: u32) -> Self {
        Self {
            textures: Vec::new(),
            by_id: FxHashMap::default(),
            max_idle_frames: max_idle_frames.max(1),
            created: 0,
        }
    }

    pub fn set_max_idle_frames(&mut self, frames: u32) {
        self.max_idle_frames = frames.max(1);
    }

    /// Pool size for a source size scaled by `multiplier`.
    #[must_use]
    pub fn scaled_size(size: (u32, u32), multiplier: f32) -> (u32, u32) {
        let scale = |v: u32| {
            let scaled = (v as f32 * multiplier).round().max(1.0) as u32;
            next_multiple_of_4(scaled)
        };
        (scale(size.0), scale(size.1))
    }

    /// Returns a texture for `name`, reusing a free pooled one with the
    /// same key. Sizes are rounded up to a multiple of 4.
    pub fn acquire(
        &mut self,
        backend: &mut dyn RenderBackend,
        name: &str,
        size: (u32, u32),
        format: wgpu::TextureFormat,
    ) -> Result<TextureId> {
        self.acquire_with_lifetime(backend, name, size, format, false)
    }

    /// Like [`acquire`](Self::acquire); a scene-lifetime texture is never
    /// reclaimed by [`end_frame`](Self::end_frame).
    pub fn acquire_with_lifetime(
        &mut self,
        backend: &mut dyn RenderBackend,
        name: &str,
        size: (u32, u32),
        format: wgpu::TextureFormat,
        scene_lifetime: bool,
    ) -> Result<TextureId> {
        let key = PoolKey {
            name: interner::intern(name),
            width: next_multiple_of_4(size.0.max(1)),
            height: next_multiple_of_4(size.1.max(1)),
            format,
        };

        // Scene-lifetime textures are shared; frame textures must be free.
        let reusable = self
            .textures
            .iter_mut()
            .find(|t| t.key == key && (t.refcount == 0 || (scene_lifetime && t.scene_lifetime)));
        if let Some(texture) = reusable {
            texture.refcount += 1;
            texture.requested = true;
            texture.idle_frames = 0;
            texture.scene_lifetime |= scene_lifetime;
            log::trace!("Effect pool hit: {name} {}x{}", key.width, key.height);
            return Ok(texture.id);
        }

        let usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        let id = backend.create_texture(&TextureDesc::d2(
            "lumen.effect.buffer",
            key.width,
            key.height,
            format,
            usage,
        ))?;
        self.created += 1;
        self.by_id.insert(id, self.textures.len());
        self.textures.push(PooledTexture {
            key,
            id,
            refcount: 1,
            requested: true,
            scene_lifetime,
            idle_frames: 0,
        });
        log::debug!("Effect pool created {name} {}x{} {format:?}", key.width, key.height);
        Ok(id)
    }

    /// Drops one reference. The texture stays pooled until
    /// [`end_frame`](Self::end_frame) finds it unused.
    pub fn release(&mut self, id: TextureId) {
        match self.by_id.get(&id) {
            Some(&index) => {
                let texture = &mut self.textures[index];
                if texture.refcount == 0 {
                    log::warn!("Effect texture released more often than acquired");
                } else {
                    texture.refcount -= 1;
                }
            }
            None => log::trace!("Release of non-pooled texture ignored"),
        }
    }

    /// Frame boundary: destroys textures that were neither referenced nor
    /// requested for `max_idle_frames` consecutive frames.
    pub fn end_frame(&mut self, backend: &mut dyn RenderBackend) {
        let max_idle = self.max_idle_frames;
        let before = self.textures.len();
        self.textures.retain_mut(|texture| {
            if texture.requested || texture.refcount > 0 || texture.scene_lifetime {
                texture.idle_frames = 0;
            } else {
                texture.idle_frames += 1;
            }
            texture.requested = false;

            let keep = texture.idle_frames < max_idle;
            if !keep {
                backend.destroy_texture(texture.id);
            }
            keep
        });
        if self.textures.len() != before {
            log::debug!("Effect pool released {} textures", before - self.textures.len());
            self.rebuild_index();
        }
    }

    pub fn release_all(&mut self, backend: &mut dyn RenderBackend) {
        for texture in self.textures.drain(..) {
            backend.destroy_texture(texture.id);
        }
        self.by_id.clear();
    }

    #[must_use]
    pub fn contains(&self, id: TextureId) -> bool {
        self.by_id.contains_key(&id)
    }

    #[must_use]
    pub fn refcount(&self, id: TextureId) -> Option<u32> {
        self.by_id.get(&id).map(|&i| self.textures[i].refcount)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Textures created over the pool's lifetime.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created
    }

    fn rebuild_index(&mut self) {
        self.by_id.clear();
        for (i, texture) in self.textures.iter().enumerate() {
            self.by_id.insert(texture.id, i);
        }
    }
}
