use crate::error::IndexError;
use crate::index::VectorIndex;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn exists(&self, location: &Path) -> Result<bool, IndexError>;

    /// Fails with [`IndexError::NotFound`] when nothing is persisted at `location`.
    async fn read(&self, location: &Path) -> Result<VectorIndex, IndexError>;

    /// Replaces whatever is stored at `index.location()`. A failed or
    /// cancelled write must leave the previous contents in place.
    async fn write(&self, index: &VectorIndex) -> Result<(), IndexError>;
}
