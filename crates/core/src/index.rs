use crate::chunking::ChunkingConfig;
use crate::embeddings::Embedder;
use crate::error::{ConfigError, EmbeddingError, IndexError};
use crate::models::TextChunk;
use crate::traits::IndexBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const INDEX_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexMetadata {
    pub format_version: u32,
    pub embedder: String,
    /// `None` only for an index without entries.
    pub dimensions: Option<usize>,
    pub chunking: Option<ChunkingConfig>,
    pub document_checksum: Option<String>,
    pub source_path: Option<String>,
    pub chunk_count: usize,
    pub build_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// What the chunks were derived from, recorded for staleness checks.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub source_path: Option<String>,
    pub document_checksum: Option<String>,
    pub chunking: Option<ChunkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk: TextChunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: TextChunk,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    location: PathBuf,
    metadata: IndexMetadata,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    pub fn from_parts(location: PathBuf, metadata: IndexMetadata, entries: Vec<IndexEntry>) -> Self {
        Self {
            location,
            metadata,
            entries,
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        let corrupt = |details: String| IndexError::corrupt(&self.location, details);

        if self.metadata.format_version != INDEX_FORMAT_VERSION {
            return Err(corrupt(format!(
                "format version {} is not {INDEX_FORMAT_VERSION}",
                self.metadata.format_version
            )));
        }
        if self.metadata.chunk_count != self.entries.len() {
            return Err(corrupt(format!(
                "metadata lists {} chunks but {} entries are stored",
                self.metadata.chunk_count,
                self.entries.len()
            )));
        }

        match self.metadata.dimensions {
            None if !self.entries.is_empty() => {
                return Err(corrupt("entries stored without a dimensionality".to_string()))
            }
            Some(0) => return Err(corrupt("dimensionality is zero".to_string())),
            Some(dimensions) => {
                if let Some(entry) = self
                    .entries
                    .iter()
                    .find(|entry| entry.embedding.len() != dimensions)
                {
                    return Err(corrupt(format!(
                        "chunk {} has {} dimensions, expected {dimensions}",
                        entry.chunk.source_ordinal,
                        entry.embedding.len()
                    )));
                }
            }
            None => {}
        }

        if self
            .entries
            .windows(2)
            .any(|pair| pair[0].chunk.source_ordinal >= pair[1].chunk.source_ordinal)
        {
            return Err(corrupt("chunk ordinals are not strictly increasing".to_string()));
        }

        Ok(())
    }

    pub async fn query<E>(&self, embedder: &E, text: &str, k: usize) -> Result<Vec<ScoredChunk>, IndexError>
    where
        E: Embedder + ?Sized,
    {
        if k == 0 {
            return Err(ConfigError::ZeroTopK.into());
        }
        self.ensure_embedder(embedder)?;
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let vector = embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Response("no vector returned for query".to_string()))?;

        self.rank(&vector, k)
    }

    /// Cosine similarity against every entry; descending score, ties by lower ordinal.
    pub fn rank(&self, query_vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        if k == 0 {
            return Err(ConfigError::ZeroTopK.into());
        }
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dimensions) = self.metadata.dimensions {
            if query_vector.len() != dimensions {
                return Err(IndexError::corrupt(
                    &self.location,
                    format!(
                        "query has {} dimensions, index has {dimensions}",
                        query_vector.len()
                    ),
                ));
            }
        }

        let mut scored = self
            .entries
            .iter()
            .map(|entry| (cosine_similarity(query_vector, &entry.embedding), entry))
            .collect::<Vec<_>>();

        scored.sort_by(|(left_score, left), (right_score, right)| {
            right_score
                .total_cmp(left_score)
                .then_with(|| left.chunk.source_ordinal.cmp(&right.chunk.source_ordinal))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, entry)| ScoredChunk {
                chunk: entry.chunk.clone(),
                score,
            })
            .collect())
    }

    fn ensure_embedder<E>(&self, embedder: &E) -> Result<(), IndexError>
    where
        E: Embedder + ?Sized,
    {
        let identifier = embedder.identifier();
        if identifier != self.metadata.embedder {
            return Err(IndexError::EmbedderMismatch {
                location: self.location.clone(),
                expected: identifier,
                found: self.metadata.embedder.clone(),
            });
        }
        Ok(())
    }
}

fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot = left.iter().zip(right).map(|(a, b)| a * b).sum::<f32>();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    let score = dot / (left_norm * right_norm);
    if score.is_nan() {
        0.0
    } else {
        score
    }
}

pub struct IndexStore<B> {
    backend: B,
    batch_size: usize,
}

impl<B> IndexStore<B>
where
    B: IndexBackend,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    pub async fn exists(&self, location: &Path) -> Result<bool, IndexError> {
        self.backend.exists(location).await
    }

    /// Embeds every chunk in batches and persists the result at `location`.
    ///
    /// Nothing is written until all embeddings succeeded, so an error or a
    /// dropped future leaves any earlier index at `location` untouched.
    pub async fn build<E>(
        &self,
        location: &Path,
        chunks: Vec<TextChunk>,
        embedder: &E,
        provenance: Provenance,
    ) -> Result<VectorIndex, IndexError>
    where
        E: Embedder + ?Sized,
    {
        let mut entries = Vec::with_capacity(chunks.len());
        let mut dimensions: Option<usize> = None;
        let batches = chunks.len().div_ceil(self.batch_size);

        for (batch_no, batch) in chunks.chunks(self.batch_size).enumerate() {
            let texts = batch
                .iter()
                .map(|chunk| chunk.content.clone())
                .collect::<Vec<_>>();
            let vectors = embedder.embed(&texts).await?;

            if vectors.len() != batch.len() {
                return Err(EmbeddingError::Response(format!(
                    "received {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                ))
                .into());
            }

            for (chunk, embedding) in batch.iter().zip(vectors) {
                let expected = *dimensions.get_or_insert(embedding.len());
                if embedding.len() != expected || expected == 0 {
                    return Err(EmbeddingError::Response(format!(
                        "chunk {} embedded with {} dimensions, expected {expected}",
                        chunk.source_ordinal,
                        embedding.len()
                    ))
                    .into());
                }
                entries.push(IndexEntry {
                    chunk: chunk.clone(),
                    embedding,
                });
            }

            debug!(batch = batch_no + 1, batches, "embedded chunk batch");
        }

        let metadata = IndexMetadata {
            format_version: INDEX_FORMAT_VERSION,
            embedder: embedder.identifier(),
            dimensions,
            chunking: provenance.chunking,
            document_checksum: provenance.document_checksum,
            source_path: provenance.source_path,
            chunk_count: entries.len(),
            build_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let index = VectorIndex::from_parts(location.to_path_buf(), metadata, entries);
        index.validate()?;

        self.backend.write(&index).await?;
        info!(
            location = %location.display(),
            chunks = index.len(),
            embedder = %index.metadata.embedder,
            "index built and persisted"
        );
        Ok(index)
    }

    pub async fn load<E>(&self, location: &Path, embedder: &E) -> Result<VectorIndex, IndexError>
    where
        E: Embedder + ?Sized,
    {
        let index = self.backend.read(location).await?;
        index.validate()?;
        index.ensure_embedder(embedder)?;
        info!(location = %location.display(), chunks = index.len(), "index loaded");
        Ok(index)
    }

    pub async fn query<E>(
        &self,
        index: &VectorIndex,
        embedder: &E,
        text: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, IndexError>
    where
        E: Embedder + ?Sized,
    {
        index.query(embedder, text, k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::split_text;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::stores::DirectoryBackend;
    use async_trait::async_trait;
    use tempfile::tempdir;

    fn chunk(ordinal: u64, content: &str) -> TextChunk {
        TextChunk {
            content: content.to_string(),
            source_ordinal: ordinal,
            start: 0,
            end: content.chars().count(),
            page: None,
        }
    }

    struct FixedEmbedder {
        vectors: Vec<Vec<f32>>,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn identifier(&self) -> String {
            "fixed".to_string()
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let slot = text.len() % self.vectors.len();
                    self.vectors[slot].clone()
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn build_then_load_round_trips_without_reembedding() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let location = dir.path().join("index");
        let embedder = CharacterNgramEmbedder::default();
        let store = IndexStore::new(DirectoryBackend).with_batch_size(2)?;
        let chunks = vec![
            chunk(0, "hydraulic pump pressure"),
            chunk(1, "valve seal replacement"),
            chunk(2, "electrical wiring diagram"),
        ];

        let built = store
            .build(&location, chunks.clone(), &embedder, Provenance::default())
            .await?;
        let loaded = store.load(&location, &embedder).await?;

        assert_eq!(built.metadata(), loaded.metadata());
        assert_eq!(
            loaded.entries().iter().map(|e| e.chunk.clone()).collect::<Vec<_>>(),
            chunks
        );
        Ok(())
    }

    #[tokio::test]
    async fn query_ranks_by_similarity() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let embedder = CharacterNgramEmbedder::default();
        let store = IndexStore::new(DirectoryBackend);
        let index = store
            .build(
                &dir.path().join("index"),
                vec![
                    chunk(0, "electrical wiring diagram"),
                    chunk(1, "hydraulic pump pressure"),
                    chunk(2, "valve seal replacement"),
                    chunk(3, "pump pressure relief"),
                ],
                &embedder,
                Provenance::default(),
            )
            .await?;

        let hits = store.query(&index, &embedder, "hydraulic pump pressure", 3).await?;

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk.source_ordinal, 1);
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
        Ok(())
    }

    #[tokio::test]
    async fn equal_scores_fall_back_to_ordinal_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let embedder = CharacterNgramEmbedder::default();
        let store = IndexStore::new(DirectoryBackend);
        let chunks = split_text(
            "A. B. C.",
            ChunkingConfig {
                max_chars: 4,
                overlap_chars: 1,
            },
        )?;
        let index = store
            .build(&dir.path().join("index"), chunks, &embedder, Provenance::default())
            .await?;

        // A single letter has no trigrams, so every score is zero.
        let hits = index.query(&embedder, "B", 2).await?;

        assert_eq!(
            hits.iter().map(|hit| hit.chunk.content.as_str()).collect::<Vec<_>>(),
            vec!["A. B", "B. C"]
        );
        assert!(hits[0].chunk.content.contains('B'));
        Ok(())
    }

    #[tokio::test]
    async fn result_length_is_capped_by_index_size() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let embedder = CharacterNgramEmbedder::default();
        let store = IndexStore::new(DirectoryBackend);
        let index = store
            .build(
                &dir.path().join("index"),
                vec![chunk(0, "only chunk here")],
                &embedder,
                Provenance::default(),
            )
            .await?;

        assert_eq!(index.query(&embedder, "chunk", 3).await?.len(), 1);
        assert!(matches!(
            index.query(&embedder, "chunk", 0).await,
            Err(IndexError::Config(ConfigError::ZeroTopK))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn load_rejects_other_embedder() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let location = dir.path().join("index");
        let store = IndexStore::new(DirectoryBackend);
        store
            .build(
                &location,
                vec![chunk(0, "pump")],
                &CharacterNgramEmbedder { dimensions: 16 },
                Provenance::default(),
            )
            .await?;

        let result = store
            .load(&location, &CharacterNgramEmbedder { dimensions: 32 })
            .await;
        assert!(matches!(result, Err(IndexError::EmbedderMismatch { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn load_of_missing_index_is_not_found() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(DirectoryBackend);
        let result = store
            .load(&dir.path().join("nothing"), &CharacterNgramEmbedder::default())
            .await;
        assert!(matches!(result, Err(IndexError::NotFound { .. })));
    }

    #[tokio::test]
    async fn inconsistent_dimensions_are_rejected_at_build() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(DirectoryBackend);
        let embedder = FixedEmbedder {
            vectors: vec![vec![1.0, 0.0], vec![1.0, 0.0, 0.0]],
        };

        let result = store
            .build(
                &dir.path().join("index"),
                vec![chunk(0, "ab"), chunk(1, "abc")],
                &embedder,
                Provenance::default(),
            )
            .await;

        assert!(matches!(result, Err(IndexError::Embedding(_))));
        assert!(!store.exists(&dir.path().join("index")).await.unwrap());
    }

    #[test]
    fn query_with_wrong_dimensionality_is_corrupt() {
        let index = VectorIndex::from_parts(
            PathBuf::from("mem"),
            IndexMetadata {
                format_version: INDEX_FORMAT_VERSION,
                embedder: "fixed".to_string(),
                dimensions: Some(2),
                chunking: None,
                document_checksum: None,
                source_path: None,
                chunk_count: 1,
                build_id: Uuid::new_v4(),
                created_at: Utc::now(),
            },
            vec![IndexEntry {
                chunk: chunk(0, "x"),
                embedding: vec![1.0, 0.0],
            }],
        );

        assert!(matches!(
            index.rank(&[1.0, 0.0, 0.0], 1),
            Err(IndexError::Corrupt { .. })
        ));
    }

    #[test]
    fn validate_catches_count_mismatch() {
        let index = VectorIndex::from_parts(
            PathBuf::from("mem"),
            IndexMetadata {
                format_version: INDEX_FORMAT_VERSION,
                embedder: "fixed".to_string(),
                dimensions: Some(2),
                chunking: None,
                document_checksum: None,
                source_path: None,
                chunk_count: 5,
                build_id: Uuid::new_v4(),
                created_at: Utc::now(),
            },
            vec![IndexEntry {
                chunk: chunk(0, "x"),
                embedding: vec![1.0, 0.0],
            }],
        );

        assert!(matches!(index.validate(), Err(IndexError::Corrupt { .. })));
    }
}
