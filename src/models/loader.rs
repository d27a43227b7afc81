//! Model loading contract and the memory-mapped file loader.
//!
//! The cache never interprets a model. It asks a [`ModelLoader`] how much
//! memory a path will need, loads it outside every internal lock, and hands
//! the opaque [`ModelHandle`] back to the loader when the entry is dropped.

use std::any::Any;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Model path not allowed: {0}")]
    PathNotAllowed(PathBuf),

    #[error("Model file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Loader backend error: {0}")]
    Backend(String),
}

/// Where a model's weights live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Local,
    Cloud,
    Quantized,
}

/// What the loader reports about a path before loading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub size_mb: u64,
    /// Cache budget charged while the model is resident.
    pub memory_requirement_mb: u64,
    pub model_type: ModelType,
}

/// Opaque, cheaply clonable handle to a loaded model.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ModelHandle {
    pub fn new<T: Any + Send + Sync>(model: T) -> Self {
        Self { inner: Arc::new(model) }
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// True when both handles refer to the same loaded model.
    pub fn ptr_eq(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// Loader and unloader callbacks injected into the cache.
///
/// `probe` and `load` run outside the cache lock and may be invoked
/// concurrently for different paths.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Report size and memory requirement without loading.
    async fn probe(&self, path: &str) -> Result<ModelDescriptor, LoadError>;

    /// Load the model at `path`.
    async fn load(&self, path: &str) -> Result<ModelHandle, LoadError>;

    /// Release a handle the cache no longer tracks. Must not block indefinitely.
    fn unload(&self, handle: ModelHandle) {
        drop(handle);
    }
}

/// Allowed directories for model loading.
const ALLOWED_DIRS: &[&str] = &["models", "tokenizers"];

/// Validated model path within allowed directories.
#[derive(Debug, Clone)]
pub struct ModelPath {
    path: PathBuf,
}

impl ModelPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

/// Loads model files by memory-mapping them, restricted to allowed directories.
pub struct MmapLoader {
    base_path: PathBuf,
}

impl MmapLoader {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Validate and create a ModelPath if within allowed directories.
    pub fn validate_path(&self, relative_path: &str) -> Result<ModelPath, LoadError> {
        let full_path = self.base_path.join(relative_path);
        let canonical = full_path
            .canonicalize()
            .map_err(|_| LoadError::NotFound(full_path.clone()))?;

        let is_allowed = ALLOWED_DIRS.iter().any(|dir| {
            self.base_path
                .join(dir)
                .canonicalize()
                .map(|allowed| canonical.starts_with(&allowed))
                .unwrap_or(false)
        });

        if !is_allowed {
            return Err(LoadError::PathNotAllowed(canonical));
        }

        Ok(ModelPath { path: canonical })
    }
}

#[async_trait]
impl ModelLoader for MmapLoader {
    async fn probe(&self, path: &str) -> Result<ModelDescriptor, LoadError> {
        let model_path = self.validate_path(path)?;
        let bytes = std::fs::metadata(model_path.as_path())?.len();
        let size_mb = bytes.div_ceil(MB).max(1);
        let model_type = if path.contains("q4") || path.contains("q8") {
            ModelType::Quantized
        } else {
            ModelType::Local
        };
        Ok(ModelDescriptor { size_mb, memory_requirement_mb: size_mb, model_type })
    }

    async fn load(&self, path: &str) -> Result<ModelHandle, LoadError> {
        let model_path = self.validate_path(path)?;
        let mapped = tokio::task::spawn_blocking(move || MappedModel::open(&model_path))
            .await
            .map_err(|e| LoadError::Backend(e.to_string()))??;
        if mapped.is_empty() {
            return Err(LoadError::InvalidFormat(format!("{path} is empty")));
        }
        Ok(ModelHandle::new(mapped))
    }
}

/// Memory-mapped model for zero-copy loading.
pub struct MappedModel {
    mmap: Mmap,
}

impl MappedModel {
    /// Memory-map a model file for zero-copy access.
    pub fn open(path: &ModelPath) -> Result<Self, LoadError> {
        let file = File::open(path.as_path())?;
        // SAFETY: File is opened read-only, model files are not modified during runtime
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }

    /// Get model data as a byte slice (zero-copy).
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}
