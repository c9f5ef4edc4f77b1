//! Resource definitions and the GPU resource cache.
//!
//! - [`MeshData`] / [`ImageData`]: CPU-side data from asset providers
//! - [`GpuMesh`] / [`GpuTexture`]: uploaded forms
//! - [`BufferManager`]: content-keyed cache with user tracking
//! - [`AssetProvider`]: the loading boundary, sync or on worker threads
//! - [`primitives`]: `#Cube`, `#Rectangle`, `#Sphere`

pub mod buffer_manager;
pub mod mesh;
pub mod primitives;
pub mod provider;
pub mod texture;

pub use buffer_manager::{BufferManager, MeshHandle, MeshKey, TextureHandle, TextureKey};
pub use mesh::{
    Aabb, GpuMesh, GpuSubset, MeshData, MeshLod, MeshSubset, MorphLayout, MorphTargetData, PickGeometry,
    VertexAttributes, MAX_MORPH_TARGETS,
};
pub use provider::{
    AssetProvider, AssetRequest, AssetResult, AsyncAssetLoader, FsAssetProvider, LoadedAsset,
    MemoryAssetProvider,
};
pub use texture::{GpuTexture, ImageData, MipLevel};
