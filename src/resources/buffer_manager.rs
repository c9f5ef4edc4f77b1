//! Buffer/Resource Manager
//!
//! Caches GPU meshes and textures by content identity and tracks which
//! nodes use them.
//!
//! | Source | Cache key | Re-upload trigger |
//! |--------|-----------|-------------------|
//! | mesh path | `MeshKey::Path` | never |
//! | inline geometry | `MeshKey::Geometry` | geometry version bump |
//! | image path | `TextureKey::Path { path, mip_mode }` | never |
//! | texture data | `TextureKey::Data { id, shape }` | data version bump |
//!
//! `shape` hashes width, height, format and transparency only. Replacing the
//! pixels of same-shaped data bumps its version and reuses the entry; a shape
//! change produces a new key and a new GPU texture.
//!
//! Nothing here fails a frame. Missing or malformed assets are logged and
//! replaced: meshes by an undrawable placeholder, textures by a shared 1×1
//! texture.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;

use super::mesh::{GpuMesh, GpuSubset, MeshData};
use super::primitives;
use super::provider::{AssetProvider, AssetRequest, AsyncAssetLoader, LoadedAsset};
use super::texture::{GpuTexture, ImageData};
use crate::errors::Result;
use crate::hal::{BufferDesc, RenderBackend, TextureDesc};
use crate::scene::{GeometryId, MeshSource, NodeId, SceneGraph, TextureDataId, TextureSource};
use crate::settings::MipMode;

new_key_type! {
    pub struct MeshHandle;
    pub struct TextureHandle;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MeshKey {
    Path(String),
    Geometry(GeometryId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureKey {
    Path { path: String, mip_mode: MipMode },
    Data { id: TextureDataId, shape: u64 },
}

struct MeshEntry {
    key: MeshKey,
    mesh: GpuMesh,
    users: FxHashSet<NodeId>,
    version: u64,
}

struct TextureEntry {
    key: Option<TextureKey>,
    texture: GpuTexture,
    users: FxHashSet<NodeId>,
    version: u64,
}

/// One entry a node is registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Mesh(MeshHandle),
    Texture(TextureHandle),
}

pub struct BufferManager {
    provider: Arc<dyn AssetProvider>,
    loader: Option<AsyncAssetLoader>,
    pending_mips: FxHashMap<String, MipMode>,

    meshes: SlotMap<MeshHandle, MeshEntry>,
    mesh_lookup: FxHashMap<MeshKey, MeshHandle>,

    textures: SlotMap<TextureHandle, TextureEntry>,
    texture_lookup: FxHashMap<TextureKey, TextureHandle>,
    /// Current entry per texture-data object, to detach users on shape change.
    data_textures: FxHashMap<TextureDataId, TextureHandle>,
    placeholder: Option<TextureHandle>,

    /// Reverse of the per-entry user sets.
    held: FxHashMap<NodeId, SmallVec<[Held; 4]>>,
    /// Bumped on every GPU upload or re-upload.
    uploads: u64,

    /// Paths already reported as failed, so the warning is logged once.
    failed: FxHashSet<String>,
}

impl BufferManager {
    pub fn new(provider: Arc<dyn AssetProvider>) -> Self {
        Self {
            provider,
            loader: None,
            pending_mips: FxHashMap::default(),
            meshes: SlotMap::with_key(),
            mesh_lookup: FxHashMap::default(),
            textures: SlotMap::with_key(),
            texture_lookup: FxHashMap::default(),
            data_textures: FxHashMap::default(),
            placeholder: None,
            held: FxHashMap::default(),
            uploads: 0,
            failed: FxHashSet::default(),
        }
    }

    /// Path loads go through a tokio blocking pool; results are picked up
    /// by [`pump_async_loads`](Self::pump_async_loads). Falls back to
    /// synchronous loading if the runtime cannot start.
    #[must_use]
    pub fn with_async_loading(mut self, workers: usize) -> Self {
        match AsyncAssetLoader::new(Arc::clone(&self.provider), workers) {
            Ok(loader) => self.loader = Some(loader),
            Err(err) => log::warn!("Async asset loading unavailable: {err}; loading synchronously"),
        }
        self
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.loader.is_some()
    }

    // ========================================================================
    // Meshes
    // ========================================================================

    /// Resolves `source` to a cached GPU mesh and registers `user`.
    ///
    /// Returns `None` for `MeshSource::None`, for removed geometry, and while
    /// an async load is still in flight.
    pub fn load_mesh(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        source: &MeshSource,
        user: NodeId,
    ) -> Option<MeshHandle> {
        match source {
            MeshSource::None => None,
            MeshSource::Path(path) => self.load_mesh_path(backend, path, user),
            MeshSource::Geometry(id) => self.load_geometry(backend, scene, *id, user),
        }
    }

    fn load_mesh_path(
        &mut self,
        backend: &mut dyn RenderBackend,
        path: &str,
        user: NodeId,
    ) -> Option<MeshHandle> {
        let key = MeshKey::Path(path.to_owned());
        if let Some(&handle) = self.mesh_lookup.get(&key) {
            log::trace!("Mesh cache hit: {path}");
            self.attach(Held::Mesh(handle), user);
            return Some(handle);
        }

        let loaded = if primitives::is_builtin(path) {
            primitives::builtin_mesh(path)
                .ok_or_else(|| crate::errors::LumenError::AssetNotFound(path.to_owned()))
        } else if let Some(loader) = &self.loader {
            if loader.request(AssetRequest::Mesh(path.to_owned())) {
                log::debug!("Queued async mesh load: {path}");
            }
            return None;
        } else {
            self.provider.load_mesh(path)
        };

        let mesh = match loaded {
            Ok(data) => upload_mesh(backend, &data, path),
            Err(err) => {
                log::warn!("Failed to load mesh '{path}': {err}");
                GpuMesh::placeholder()
            }
        };
        Some(self.insert_mesh(key, mesh, 0, Some(user)))
    }

    fn load_geometry(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        id: GeometryId,
        user: NodeId,
    ) -> Option<MeshHandle> {
        let Some(geometry) = scene.geometry(id) else {
            log::warn!("Model references removed geometry {id:?}");
            return None;
        };
        let key = MeshKey::Geometry(id);

        if let Some(&handle) = self.mesh_lookup.get(&key) {
            self.attach(Held::Mesh(handle), user);
            let entry = &mut self.meshes[handle];
            if entry.version != geometry.version() {
                log::debug!("Geometry {id:?} changed, re-uploading");
                destroy_mesh(backend, &entry.mesh);
                entry.mesh = upload_mesh(backend, &geometry.mesh, "geometry");
                entry.version = geometry.version();
                self.uploads += 1;
            }
            return Some(handle);
        }

        let mesh = upload_mesh(backend, &geometry.mesh, "geometry");
        Some(self.insert_mesh(key, mesh, geometry.version(), Some(user)))
    }

    fn insert_mesh(
        &mut self,
        key: MeshKey,
        mesh: GpuMesh,
        version: u64,
        user: Option<NodeId>,
    ) -> MeshHandle {
        let handle = self.meshes.insert(MeshEntry {
            key: key.clone(),
            mesh,
            users: FxHashSet::default(),
            version,
        });
        self.mesh_lookup.insert(key, handle);
        self.uploads += 1;
        if let Some(user) = user {
            self.attach(Held::Mesh(handle), user);
        }
        handle
    }

    #[must_use]
    pub fn mesh(&self, handle: MeshHandle) -> Option<&GpuMesh> {
        self.meshes.get(handle).map(|e| &e.mesh)
    }

    #[must_use]
    pub fn mesh_users(&self, handle: MeshHandle) -> usize {
        self.meshes.get(handle).map_or(0, |e| e.users.len())
    }

    #[must_use]
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// Drops the cache entry for removed inline geometry.
    pub fn release_geometry(&mut self, backend: &mut dyn RenderBackend, id: GeometryId) {
        if let Some(handle) = self.mesh_lookup.remove(&MeshKey::Geometry(id))
            && let Some(entry) = self.meshes.remove(handle)
        {
            self.unlink(&entry.users, Held::Mesh(handle));
            destroy_mesh(backend, &entry.mesh);
        }
    }

    // ========================================================================
    // Textures
    // ========================================================================

    /// Resolves `source` to a cached GPU texture and registers `user`.
    ///
    /// Missing or corrupt data resolves to the placeholder. Returns `None`
    /// only if the backend cannot create even the 1×1 placeholder.
    pub fn load_texture(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        source: &TextureSource,
        mip_mode: MipMode,
        user: NodeId,
    ) -> Option<TextureHandle> {
        let placeholder = self.ensure_placeholder(backend)?;
        let handle = match source {
            TextureSource::Path(path) => self.load_texture_path(backend, path, mip_mode, user),
            TextureSource::Data(id) => self.load_texture_data(backend, scene, *id, mip_mode, user),
        };
        Some(handle.unwrap_or(placeholder))
    }

    fn load_texture_path(
        &mut self,
        backend: &mut dyn RenderBackend,
        path: &str,
        mip_mode: MipMode,
        user: NodeId,
    ) -> Option<TextureHandle> {
        let key = TextureKey::Path {
            path: path.to_owned(),
            mip_mode,
        };
        if let Some(&handle) = self.texture_lookup.get(&key) {
            self.attach(Held::Texture(handle), user);
            return Some(handle);
        }
        if self.failed.contains(path) {
            return None;
        }

        if let Some(loader) = &self.loader {
            if loader.request(AssetRequest::Image(path.to_owned())) {
                log::debug!("Queued async image load: {path}");
                self.pending_mips.insert(path.to_owned(), mip_mode);
            }
            return None;
        }

        let uploaded = self
            .provider
            .load_image(path)
            .and_then(|image| upload_texture(backend, &image, mip_mode, path));
        match uploaded {
            Ok(texture) => Some(self.insert_texture(Some(key), texture, 0, Some(user))),
            Err(err) => {
                log::warn!("Failed to load texture '{path}': {err}; using placeholder");
                self.failed.insert(path.to_owned());
                None
            }
        }
    }

    fn load_texture_data(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        id: TextureDataId,
        mip_mode: MipMode,
        user: NodeId,
    ) -> Option<TextureHandle> {
        let Some(data) = scene.texture_data(id) else {
            log::warn!("Image references removed texture data {id:?}");
            return None;
        };
        let key = TextureKey::Data {
            id,
            shape: data.image.shape_hash(),
        };

        if let Some(&handle) = self.texture_lookup.get(&key) {
            self.attach(Held::Texture(handle), user);
            let entry = &mut self.textures[handle];
            if entry.version != data.version() {
                log::trace!("Texture data {id:?} v{} re-upload", data.version());
                if let Err(err) = write_levels(backend, &entry.texture, &data.image) {
                    log::warn!("Texture data {id:?} re-upload failed: {err}");
                }
                entry.version = data.version();
                self.uploads += 1;
            }
            return Some(handle);
        }

        // Shape changed: the old entry is stale for every user, not only
        // this one. Users that still reference the data re-attach to the
        // new entry when they next resolve it.
        if let Some(old) = self.data_textures.remove(&id)
            && let Some(entry) = self.textures.get_mut(old)
        {
            let users = std::mem::take(&mut entry.users);
            log::debug!("Texture data {id:?} changed shape; detached {} users", users.len());
            self.unlink(&users, Held::Texture(old));
        }

        match upload_texture(backend, &data.image, mip_mode, "texture-data") {
            Ok(texture) => {
                let handle = self.insert_texture(Some(key), texture, data.version(), Some(user));
                self.data_textures.insert(id, handle);
                Some(handle)
            }
            Err(err) => {
                log::warn!("Texture data {id:?} rejected: {err}; using placeholder");
                None
            }
        }
    }

    fn insert_texture(
        &mut self,
        key: Option<TextureKey>,
        texture: GpuTexture,
        version: u64,
        user: Option<NodeId>,
    ) -> TextureHandle {
        let handle = self.textures.insert(TextureEntry {
            key: key.clone(),
            texture,
            users: FxHashSet::default(),
            version,
        });
        if let Some(key) = key {
            self.texture_lookup.insert(key, handle);
        }
        self.uploads += 1;
        if let Some(user) = user {
            self.attach(Held::Texture(handle), user);
        }
        handle
    }

    /// The 1x1 white texture substituted for missing images.
    pub fn ensure_placeholder(&mut self, backend: &mut dyn RenderBackend) -> Option<TextureHandle> {
        if self.placeholder.is_some() {
            return self.placeholder;
        }
        let image = ImageData::solid(1, 1, [255, 255, 255, 255]);
        match upload_texture(backend, &image, MipMode::None, "placeholder") {
            Ok(texture) => {
                let handle = self.insert_texture(None, texture, 0, None);
                self.placeholder = Some(handle);
                Some(handle)
            }
            Err(err) => {
                log::error!("Cannot create placeholder texture: {err}");
                None
            }
        }
    }

    #[must_use]
    pub fn placeholder_texture(&self) -> Option<TextureHandle> {
        self.placeholder
    }

    #[must_use]
    pub fn is_placeholder(&self, handle: TextureHandle) -> bool {
        self.placeholder == Some(handle)
    }

    #[must_use]
    pub fn texture(&self, handle: TextureHandle) -> Option<&GpuTexture> {
        self.textures.get(handle).map(|e| &e.texture)
    }

    #[must_use]
    pub fn texture_users(&self, handle: TextureHandle) -> usize {
        self.textures.get(handle).map_or(0, |e| e.users.len())
    }

    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Drops every cache entry created from `id`.
    pub fn release_texture_data(&mut self, backend: &mut dyn RenderBackend, id: TextureDataId) {
        self.data_textures.remove(&id);
        let stale: Vec<TextureHandle> = self
            .textures
            .iter()
            .filter(|(_, e)| matches!(e.key, Some(TextureKey::Data { id: data, .. }) if data == id))
            .map(|(handle, _)| handle)
            .collect();
        for handle in stale {
            self.remove_texture(backend, handle);
        }
    }

    fn remove_texture(&mut self, backend: &mut dyn RenderBackend, handle: TextureHandle) {
        if let Some(entry) = self.textures.remove(handle) {
            if let Some(key) = &entry.key {
                self.texture_lookup.remove(key);
            }
            self.unlink(&entry.users, Held::Texture(handle));
            backend.destroy_texture(entry.texture.id);
        }
    }

    // ========================================================================
    // Lifetime
    // ========================================================================

    /// Removes `user` from every entry it is registered on. Entries left
    /// without users are evicted by the next
    /// [`cleanup_unreferenced`](Self::cleanup_unreferenced).
    ///
    /// Layer preparation calls this before resolving a node's resources, so
    /// a node only ever holds what it referenced in its latest preparation.
    pub fn release_user(&mut self, user: NodeId) {
        let Some(held) = self.held.remove(&user) else {
            return;
        };
        for item in held {
            match item {
                Held::Mesh(handle) => {
                    if let Some(entry) = self.meshes.get_mut(handle) {
                        entry.users.remove(&user);
                    }
                }
                Held::Texture(handle) => {
                    if let Some(entry) = self.textures.get_mut(handle) {
                        entry.users.remove(&user);
                    }
                }
            }
        }
    }

    /// Number of entries `user` is registered on.
    #[must_use]
    pub fn held_by(&self, user: NodeId) -> usize {
        self.held.get(&user).map_or(0, SmallVec::len)
    }

    /// The mesh `user` drew with in its latest preparation.
    #[must_use]
    pub fn mesh_for_user(&self, user: NodeId) -> Option<MeshHandle> {
        self.held.get(&user)?.iter().find_map(|item| match item {
            Held::Mesh(handle) => Some(*handle),
            Held::Texture(_) => None,
        })
    }

    /// Monotonic count of GPU uploads and re-uploads. A change across a
    /// preparation means new resource contents reached the GPU.
    #[must_use]
    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    fn attach(&mut self, item: Held, user: NodeId) {
        let inserted = match item {
            Held::Mesh(handle) => self.meshes.get_mut(handle).is_some_and(|e| e.users.insert(user)),
            Held::Texture(handle) => self
                .textures
                .get_mut(handle)
                .is_some_and(|e| e.users.insert(user)),
        };
        if inserted {
            self.held.entry(user).or_default().push(item);
        }
    }

    fn unlink(&mut self, users: &FxHashSet<NodeId>, item: Held) {
        for user in users {
            if let Some(held) = self.held.get_mut(user) {
                held.retain(|h| *h != item);
                if held.is_empty() {
                    self.held.remove(user);
                }
            }
        }
    }

    /// Destroys entries nobody uses. Returns how many were evicted.
    pub fn cleanup_unreferenced(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let meshes: Vec<MeshHandle> = self
            .meshes
            .iter()
            .filter(|(_, e)| e.users.is_empty())
            .map(|(h, _)| h)
            .collect();
        for &handle in &meshes {
            if let Some(entry) = self.meshes.remove(handle) {
                self.mesh_lookup.remove(&entry.key);
                destroy_mesh(backend, &entry.mesh);
            }
        }

        let placeholder = self.placeholder;
        let textures: Vec<TextureHandle> = self
            .textures
            .iter()
            .filter(|&(h, e)| e.users.is_empty() && Some(h) != placeholder)
            .map(|(h, _)| h)
            .collect();
        for &handle in &textures {
            self.remove_texture(backend, handle);
        }
        self.data_textures.retain(|_, h| !textures.contains(h));

        let evicted = meshes.len() + textures.len();
        if evicted > 0 {
            log::debug!("Evicted {} meshes, {} textures", meshes.len(), textures.len());
        }
        evicted
    }

    /// Releases everything the removed nodes held, plus entries whose
    /// inline source no longer exists in `scene`.
    pub fn cleanup_resources(
        &mut self,
        backend: &mut dyn RenderBackend,
        scene: &SceneGraph,
        removed: &[NodeId],
    ) {
        for &node in removed {
            self.release_user(node);
        }

        let dead_geometry: Vec<GeometryId> = self
            .mesh_lookup
            .keys()
            .filter_map(|key| match key {
                MeshKey::Geometry(id) if scene.geometry(*id).is_none() => Some(*id),
                _ => None,
            })
            .collect();
        for id in dead_geometry {
            self.release_geometry(backend, id);
        }

        let dead_data: Vec<TextureDataId> = self
            .texture_lookup
            .keys()
            .filter_map(|key| match key {
                TextureKey::Data { id, .. } if scene.texture_data(*id).is_none() => Some(*id),
                _ => None,
            })
            .collect();
        for id in dead_data {
            self.release_texture_data(backend, id);
        }
    }

    /// Creates GPU resources for finished async loads. Must run on the
    /// thread that owns `backend`.
    pub fn pump_async_loads(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let Some(loader) = &self.loader else {
            return 0;
        };
        let finished = loader.drain();
        let count = finished.len();

        for result in finished {
            let path = result.request.path().to_owned();
            match result.asset {
                LoadedAsset::Mesh(loaded) => {
                    let mesh = match loaded {
                        Ok(data) => upload_mesh(backend, &data, &path),
                        Err(err) => {
                            log::warn!("Failed to load mesh '{path}': {err}");
                            GpuMesh::placeholder()
                        }
                    };
                    let key = MeshKey::Path(path);
                    if !self.mesh_lookup.contains_key(&key) {
                        self.insert_mesh(key, mesh, 0, None);
                    }
                }
                LoadedAsset::Image(loaded) => {
                    let mip_mode = self.pending_mips.remove(&path).unwrap_or_default();
                    match loaded.and_then(|image| upload_texture(backend, &image, mip_mode, &path)) {
                        Ok(texture) => {
                            let key = TextureKey::Path { path, mip_mode };
                            if self.texture_lookup.contains_key(&key) {
                                backend.destroy_texture(texture.id);
                            } else {
                                self.insert_texture(Some(key), texture, 0, None);
                            }
                        }
                        Err(err) => {
                            log::warn!("Failed to load texture '{path}': {err}; using placeholder");
                            self.failed.insert(path);
                        }
                    }
                }
            }
        }
        count
    }

    /// Context teardown: destroys every GPU object this manager created.
    pub fn release_all(&mut self, backend: &mut dyn RenderBackend) {
        for (_, entry) in self.meshes.drain() {
            destroy_mesh(backend, &entry.mesh);
        }
        for (_, entry) in self.textures.drain() {
            backend.destroy_texture(entry.texture.id);
        }
        self.mesh_lookup.clear();
        self.texture_lookup.clear();
        self.data_textures.clear();
        self.held.clear();
        self.placeholder = None;
        self.failed.clear();
    }
}

// ============================================================================
// Upload helpers
// ============================================================================

fn upload_mesh(backend: &mut dyn RenderBackend, data: &MeshData, name: &str) -> GpuMesh {
    match try_upload_mesh(backend, data, name) {
        Ok(mesh) => mesh,
        Err(err) => {
            log::warn!("{err}; mesh '{name}' replaced by placeholder");
            GpuMesh::placeholder()
        }
    }
}

fn try_upload_mesh(backend: &mut dyn RenderBackend, data: &MeshData, name: &str) -> Result<GpuMesh> {
    data.validate(name)?;

    let vertices = data.interleave();
    let vertex_buffer = backend.create_buffer(
        &BufferDesc {
            label: "lumen.vertices",
            size: vertices.len() as u64,
            usage: wgpu::BufferUsages::VERTEX,
        },
        Some(&vertices),
    )?;

    let index_buffer = match data.index_bytes() {
        Some((bytes, format)) => {
            let created = backend.create_buffer(
                &BufferDesc {
                    label: "lumen.indices",
                    size: bytes.len() as u64,
                    usage: wgpu::BufferUsages::INDEX,
                },
                Some(&bytes),
            );
            match created {
                Ok(buffer) => Some((buffer, format)),
                Err(err) => {
                    backend.destroy_buffer(vertex_buffer);
                    return Err(err);
                }
            }
        }
        None => None,
    };

    let subsets = data
        .effective_subsets()
        .into_iter()
        .map(|subset| GpuSubset {
            bounds: data.subset_bounds(&subset),
            name: subset.name,
            offset: subset.offset,
            count: subset.count,
            lods: subset.lods,
        })
        .collect();

    Ok(GpuMesh {
        vertex_buffer: Some(vertex_buffer),
        index_buffer,
        vertex_count: data.vertex_count() as u32,
        layout: data.vertex_layout(),
        attributes: data.attributes(),
        subsets,
        bounds: data.bounds(),
        morph: data.morph_layout(),
        pick: Some(Arc::new(data.pick_geometry())),
        placeholder: false,
    })
}

fn destroy_mesh(backend: &mut dyn RenderBackend, mesh: &GpuMesh) {
    if let Some(buffer) = mesh.vertex_buffer {
        backend.destroy_buffer(buffer);
    }
    if let Some((buffer, _)) = mesh.index_buffer {
        backend.destroy_buffer(buffer);
    }
}

fn upload_texture(
    backend: &mut dyn RenderBackend,
    image: &ImageData,
    mip_mode: MipMode,
    name: &str,
) -> Result<GpuTexture> {
    image.validate(name)?;

    let max = backend.capabilities().max_texture_size;
    let clamped = image.clamped(max);
    if let Some(c) = &clamped {
        log::warn!(
            "Texture '{name}' {}x{} exceeds max size {max}, clamped to {}x{}",
            image.width,
            image.height,
            c.width,
            c.height
        );
    }
    let image = clamped.as_ref().unwrap_or(image);

    let mip_levels = match mip_mode {
        MipMode::None => 1,
        MipMode::Generated | MipMode::Bsdf => image.full_mip_count(),
    };
    let id = backend.create_texture(&TextureDesc {
        label: "lumen.texture",
        width: image.width,
        height: image.height,
        layers: 1,
        mip_level_count: mip_levels,
        format: image.format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        cube: false,
    })?;

    let texture = GpuTexture {
        id,
        width: image.width,
        height: image.height,
        format: image.format,
        mip_levels,
        has_transparency: image.has_transparency,
    };
    if let Err(err) = write_levels(backend, &texture, image) {
        backend.destroy_texture(id);
        return Err(err);
    }
    Ok(texture)
}

fn write_levels(backend: &mut dyn RenderBackend, texture: &GpuTexture, image: &ImageData) -> Result<()> {
    backend.write_texture(texture.id, 0, &image.pixels)?;
    if texture.mip_levels > 1 {
        for (level, mip) in image.mip_chain().iter().enumerate() {
            backend.write_texture(texture.id, level as u32 + 1, &mip.pixels)?;
        }
    }
    Ok(())
}
