//! Error Types
//!
//! This module defines the error types used throughout the renderer.
//!
//! # Overview
//!
//! The main error type [`LumenError`] follows the renderer's failure taxonomy:
//! - Asset errors (missing or corrupt mesh / texture data)
//! - Backend capability and resource errors
//! - Contract violations (caller misuse of the frame lifecycle or backend)
//! - Shader generation errors
//! - Configuration errors
//!
//! Asset and capability errors are normally absorbed by the resource manager
//! and replaced by placeholders; they only surface from the lower-level APIs
//! (`AssetProvider`, `RenderBackend`) that the manager wraps.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lumen::errors::{LumenError, Result};
//!
//! fn load() -> Result<()> {
//!     Err(LumenError::AssetNotFound("meshes/cube.mesh".into()))
//! }
//! ```

use thiserror::Error;

/// The main error type for the renderer.
#[derive(Error, Debug)]
pub enum LumenError {
    // ========================================================================
    // Asset Errors
    // ========================================================================
    /// The requested asset was not found by the asset provider.
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    /// Mesh data failed validation.
    #[error("Malformed mesh '{source_name}': {reason}")]
    MalformedMesh {
        /// Path or geometry label of the mesh
        source_name: String,
        /// What was wrong with it
        reason: String,
    },

    /// Texture data failed validation.
    #[error("Malformed texture '{source_name}': {reason}")]
    MalformedTexture {
        /// Path or texture-data label
        source_name: String,
        /// What was wrong with it
        reason: String,
    },

    /// Image decoding error.
    #[error("Image decode error: {0}")]
    ImageDecode(String),

    // ========================================================================
    // Backend Errors
    // ========================================================================
    /// Generic backend failure (resource creation, submission).
    #[error("Backend error: {0}")]
    Backend(String),

    /// The active backend does not support the requested feature.
    #[error("Unsupported backend feature: {0}")]
    UnsupportedFeature(&'static str),

    /// A handle did not refer to a live backend object.
    #[error("Invalid {kind} handle")]
    InvalidHandle {
        /// Resource kind (buffer, texture, ...)
        kind: &'static str,
    },

    // ========================================================================
    // Contract Violations
    // ========================================================================
    /// A caller broke an API contract (e.g. drawing outside a render pass).
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// A frame operation ran without a matching `begin_frame`.
    #[error("No frame in progress: begin_frame was not called")]
    FrameNotBegun,

    /// The node passed as a layer is not a layer.
    #[error("Node is not a layer")]
    NotALayer,

    // ========================================================================
    // Shader Errors
    // ========================================================================
    /// Template rendering failed.
    #[error("Shader template error: {0}")]
    ShaderTemplate(#[from] minijinja::Error),

    /// No template or runtime source with the given name.
    #[error("Shader source not found: {0}")]
    ShaderNotFound(String),

    // ========================================================================
    // Configuration & I/O Errors
    // ========================================================================
    /// Settings / mesh JSON parse error.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Convenient conversion implementations
// ============================================================================

impl From<image::ImageError> for LumenError {
    fn from(err: image::ImageError) -> Self {
        LumenError::ImageDecode(err.to_string())
    }
}

/// Alias for `Result<T, LumenError>`.
pub type Result<T> = std::result::Result<T, LumenError>;

/// Reports a caller contract violation.
///
/// Logs at error level, asserts in debug builds and evaluates to
/// `Err(LumenError::ContractViolation)` so release builds degrade instead of
/// aborting the frame.
#[macro_export]
macro_rules! contract_violation {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("contract violation: {message}");
        debug_assert!(false, "contract violation: {}", message);
        Err($crate::errors::LumenError::ContractViolation(message))
    }};
}
