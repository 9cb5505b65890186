use crate::chunking::{split_text, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::{ExtractionError, IndexError, PipelineError, Result};
use crate::extractor::{extract_text, TextExtractor};
use crate::index::{IndexStore, Provenance, VectorIndex};
use crate::traits::IndexBackend;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Why a persisted index was not reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    Forced,
    Missing,
    Corrupt(String),
    EmbedderChanged { expected: String, found: String },
    DocumentChanged,
    ChunkingChanged,
    LoadFailed(String),
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::Forced => f.write_str("rebuild requested"),
            RebuildReason::Missing => f.write_str("no persisted index"),
            RebuildReason::Corrupt(details) => write!(f, "persisted index is corrupt: {details}"),
            RebuildReason::EmbedderChanged { expected, found } => {
                write!(f, "index was embedded with {found}, now using {expected}")
            }
            RebuildReason::DocumentChanged => f.write_str("source document changed"),
            RebuildReason::ChunkingChanged => f.write_str("chunking configuration changed"),
            RebuildReason::LoadFailed(details) => write!(f, "index could not be loaded: {details}"),
        }
    }
}

impl From<IndexError> for RebuildReason {
    fn from(error: IndexError) -> Self {
        match error {
            IndexError::NotFound { .. } => RebuildReason::Missing,
            IndexError::Corrupt { details, .. } => RebuildReason::Corrupt(details),
            IndexError::EmbedderMismatch {
                expected, found, ..
            } => RebuildReason::EmbedderChanged { expected, found },
            other => RebuildReason::LoadFailed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOrigin {
    Reused,
    Rebuilt(RebuildReason),
}

#[derive(Debug, Clone)]
pub struct ProcessedCorpus {
    pub index: VectorIndex,
    pub origin: IndexOrigin,
}

pub async fn digest_file(path: &Path) -> std::result::Result<String, ExtractionError> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Turns a document into a query-able index, reusing a persisted one when
/// it was built from the same document, chunking and embedder.
pub struct CorpusPipeline<X, B> {
    extractor: X,
    store: IndexStore<B>,
}

impl<X, B> CorpusPipeline<X, B>
where
    X: TextExtractor,
    B: IndexBackend,
{
    pub fn new(extractor: X, store: IndexStore<B>) -> Self {
        Self { extractor, store }
    }

    pub fn store(&self) -> &IndexStore<B> {
        &self.store
    }

    pub async fn process<E>(
        &self,
        document: &Path,
        location: &Path,
        embedder: &E,
        chunking: ChunkingConfig,
        force_rebuild: bool,
    ) -> Result<VectorIndex>
    where
        E: Embedder + ?Sized,
    {
        Ok(self
            .process_detailed(document, location, embedder, chunking, force_rebuild)
            .await?
            .index)
    }

    /// Like [`process`](Self::process), also reporting whether the index was reused.
    ///
    /// Load failures never escape: a missing, corrupt or stale index is
    /// rebuilt. Extraction, embedding and persistence failures of the
    /// rebuild itself are returned.
    pub async fn process_detailed<E>(
        &self,
        document: &Path,
        location: &Path,
        embedder: &E,
        chunking: ChunkingConfig,
        force_rebuild: bool,
    ) -> Result<ProcessedCorpus>
    where
        E: Embedder + ?Sized,
    {
        chunking.validate()?;

        let checksum = digest_file(document)
            .await
            .map_err(|source| PipelineError::Extraction {
                path: document.to_path_buf(),
                source,
            })?;

        let reason = if force_rebuild {
            RebuildReason::Forced
        } else {
            match self.try_reuse(location, embedder, &checksum, chunking).await {
                Ok(index) => {
                    info!(
                        document = %document.display(),
                        location = %location.display(),
                        chunks = index.len(),
                        "reusing persisted index"
                    );
                    return Ok(ProcessedCorpus {
                        index,
                        origin: IndexOrigin::Reused,
                    });
                }
                Err(reason) => reason,
            }
        };

        match &reason {
            RebuildReason::Forced | RebuildReason::Missing => {
                info!(location = %location.display(), %reason, "building index")
            }
            _ => warn!(location = %location.display(), %reason, "rebuilding index"),
        }

        let index = self
            .rebuild(document, location, embedder, chunking, checksum)
            .await?;
        Ok(ProcessedCorpus {
            index,
            origin: IndexOrigin::Rebuilt(reason),
        })
    }

    async fn try_reuse<E>(
        &self,
        location: &Path,
        embedder: &E,
        checksum: &str,
        chunking: ChunkingConfig,
    ) -> std::result::Result<VectorIndex, RebuildReason>
    where
        E: Embedder + ?Sized,
    {
        let index = self.store.load(location, embedder).await?;
        let metadata = index.metadata();

        if metadata.chunking != Some(chunking) {
            return Err(RebuildReason::ChunkingChanged);
        }
        if metadata.document_checksum.as_deref() != Some(checksum) {
            return Err(RebuildReason::DocumentChanged);
        }
        Ok(index)
    }

    async fn rebuild<E>(
        &self,
        document: &Path,
        location: &Path,
        embedder: &E,
        chunking: ChunkingConfig,
        checksum: String,
    ) -> Result<VectorIndex>
    where
        E: Embedder + ?Sized,
    {
        let text = extract_text(&self.extractor, document)
            .await
            .map_err(|source| PipelineError::Extraction {
                path: document.to_path_buf(),
                source,
            })?;

        let chunks = split_text(&text, chunking)?;
        info!(document = %document.display(), chunks = chunks.len(), "split document into chunks");

        let provenance = Provenance {
            source_path: Some(document.to_string_lossy().to_string()),
            document_checksum: Some(checksum),
            chunking: Some(chunking),
        };

        self.store
            .build(location, chunks, embedder, provenance)
            .await
            .map_err(|source| PipelineError::Index {
                path: document.to_path_buf(),
                source,
            })
    }
}
