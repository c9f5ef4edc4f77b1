//! Asset provider boundary.
//!
//! The renderer never reads files itself. Mesh and image bytes come from an
//! [`AssetProvider`]; errors cross this boundary as values and are absorbed
//! by the buffer manager.
//!
//! [`AsyncAssetLoader`] runs a provider on a tokio blocking pool. Finished
//! loads queue on a channel and are drained on the render thread, which is
//! the only place GPU objects get created.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::runtime::Runtime;

use super::mesh::MeshData;
use super::texture::ImageData;
use crate::errors::{LumenError, Result};

pub trait AssetProvider: Send + Sync {
    fn load_mesh(&self, path: &str) -> Result<MeshData>;
    fn load_image(&self, path: &str) -> Result<ImageData>;
}

// ============================================================================
// In-memory provider
// ============================================================================

/// Registry of preloaded assets, keyed by path.
#[derive(Default)]
pub struct MemoryAssetProvider {
    meshes: RwLock<FxHashMap<String, MeshData>>,
    images: RwLock<FxHashMap<String, ImageData>>,
}

impl MemoryAssetProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_mesh(&self, path: impl Into<String>, mesh: MeshData) {
        self.meshes.write().insert(path.into(), mesh);
    }

    pub fn insert_image(&self, path: impl Into<String>, image: ImageData) {
        self.images.write().insert(path.into(), image);
    }

    pub fn remove(&self, path: &str) {
        self.meshes.write().remove(path);
        self.images.write().remove(path);
    }
}

impl AssetProvider for MemoryAssetProvider {
    fn load_mesh(&self, path: &str) -> Result<MeshData> {
        self.meshes
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| LumenError::AssetNotFound(path.to_owned()))
    }

    fn load_image(&self, path: &str) -> Result<ImageData> {
        self.images
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| LumenError::AssetNotFound(path.to_owned()))
    }
}

// ============================================================================
// Filesystem provider
// ============================================================================

/// Reads assets relative to a root directory. Images go through the `image`
/// crate, meshes are serde JSON [`MeshData`].
pub struct FsAssetProvider {
    root: PathBuf,
}

impl FsAssetProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(path);
        std::fs::read(&full).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => LumenError::AssetNotFound(path.to_owned()),
            _ => LumenError::Io(err),
        })
    }
}

impl AssetProvider for FsAssetProvider {
    fn load_mesh(&self, path: &str) -> Result<MeshData> {
        let bytes = self.read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn load_image(&self, path: &str) -> Result<ImageData> {
        let bytes = self.read(path)?;
        ImageData::decode(&bytes)
    }
}

// ============================================================================
// Async loader
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetRequest {
    Mesh(String),
    Image(String),
}

impl AssetRequest {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Mesh(path) | Self::Image(path) => path,
        }
    }
}

#[derive(Debug)]
pub enum LoadedAsset {
    Mesh(Result<MeshData>),
    Image(Result<ImageData>),
}

#[derive(Debug)]
pub struct AssetResult {
    pub request: AssetRequest,
    pub asset: LoadedAsset,
}

/// Runs an [`AssetProvider`] on a dedicated tokio runtime.
///
/// Provider calls are blocking file or decode work, so each request goes to
/// `spawn_blocking`; the pool is capped at the requested worker count.
pub struct AsyncAssetLoader {
    runtime: Option<Runtime>,
    provider: Arc<dyn AssetProvider>,
    results_tx: flume::Sender<AssetResult>,
    results: flume::Receiver<AssetResult>,
    pending: Arc<Mutex<FxHashSet<AssetRequest>>>,
}

impl AsyncAssetLoader {
    pub fn new(provider: Arc<dyn AssetProvider>, worker_count: usize) -> Result<Self> {
        let workers = worker_count.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("lumen-asset")
            .build()?;
        let (results_tx, results) = flume::unbounded();

        log::debug!("Async asset loader started with {workers} workers");
        Ok(Self {
            runtime: Some(runtime),
            provider,
            results_tx,
            results,
            pending: Arc::new(Mutex::new(FxHashSet::default())),
        })
    }

    /// Queues a load. Returns `false` if the same request is already in flight.
    pub fn request(&self, request: AssetRequest) -> bool {
        if !self.pending.lock().insert(request.clone()) {
            return false;
        }
        let Some(runtime) = &self.runtime else {
            log::warn!("Asset loader is shut down, dropping '{}'", request.path());
            self.pending.lock().remove(&request);
            return false;
        };

        let provider = Arc::clone(&self.provider);
        let results = self.results_tx.clone();
        runtime.spawn_blocking(move || {
            let asset = match &request {
                AssetRequest::Mesh(path) => LoadedAsset::Mesh(provider.load_mesh(path)),
                AssetRequest::Image(path) => LoadedAsset::Image(provider.load_image(path)),
            };
            // The receiver lives as long as the loader.
            let _ = results.send(AssetResult { request, asset });
        });
        true
    }

    #[must_use]
    pub fn is_pending(&self, request: &AssetRequest) -> bool {
        self.pending.lock().contains(request)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Non-blocking: takes every finished load.
    pub fn drain(&self) -> Vec<AssetResult> {
        let finished: Vec<AssetResult> = self.results.try_iter().collect();
        if !finished.is_empty() {
            let mut pending = self.pending.lock();
            for result in &finished {
                pending.remove(&result.request);
            }
        }
        finished
    }

    /// Blocks until nothing is pending or `timeout` elapses.
    pub fn drain_wait(&self, timeout: Duration) -> Vec<AssetResult> {
        let deadline = Instant::now() + timeout;
        let mut finished = Vec::new();
        while self.pending_count() > finished.len() {
            match self.results.recv_deadline(deadline) {
                Ok(result) => finished.push(result),
                Err(_) => break,
            }
        }
        finished.extend(self.results.try_iter());
        let mut pending = self.pending.lock();
        for result in &finished {
            pending.remove(&result.request);
        }
        finished
    }
}

impl Drop for AsyncAssetLoader {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Loads still running are abandoned; their results have no reader.
            runtime.shutdown_timeout(Duration::from_millis(500));
        }
    }
}
