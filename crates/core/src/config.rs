use crate::chunking::ChunkingConfig;
use crate::conversation::EngineConfig;
use crate::error::ConfigError;
use crate::models::GenerationModel;
use std::path::PathBuf;

pub const DEFAULT_INDEX_LOCATION: &str = "./pdf_index";

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
    pub retrieval_k: usize,
    /// Most recent turns replayed into each prompt.
    pub history_turns: usize,
    pub generation_model: GenerationModel,
    pub temperature: f32,
    pub embedding_batch_size: usize,
    pub index_location: PathBuf,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            chunk_max_chars: 1_000,
            chunk_overlap_chars: 200,
            retrieval_k: 3,
            history_turns: 10,
            generation_model: GenerationModel::default(),
            temperature: 0.7,
            embedding_batch_size: 64,
            index_location: PathBuf::from(DEFAULT_INDEX_LOCATION),
        }
    }
}

impl ChatOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunking().validate()?;
        if self.retrieval_k == 0 {
            return Err(ConfigError::ZeroTopK);
        }
        if self.embedding_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }

    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            max_chars: self.chunk_max_chars,
            overlap_chars: self.chunk_overlap_chars,
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            top_k: self.retrieval_k,
            history_turns: self.history_turns,
        }
    }
}
