pub mod chunking;
pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod session;
pub mod stores;
pub mod traits;

#[cfg(test)]
mod test_http;

pub use chunking::{reconstruct, split_text, ChunkingConfig};
pub use config::{ChatOptions, DEFAULT_INDEX_LOCATION};
pub use conversation::{compose_prompt, ConversationEngine, EngineConfig, SYSTEM_PROMPT};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_EMBEDDING_MODEL,
};
pub use error::{
    AnswerError, ConfigError, EmbeddingError, ExtractionError, GenerationError, IndexError,
    PipelineError, SessionError,
};
pub use extractor::{extract_text, render_pages, LopdfExtractor, OcrEndpointConfig, PageText, TextExtractor};
pub use generation::{ChatModel, OpenAiChatModel};
pub use index::{IndexEntry, IndexMetadata, IndexStore, Provenance, ScoredChunk, VectorIndex};
pub use models::{Answer, GenerationModel, PromptMessage, Role, TextChunk, Transcript, Turn};
pub use pipeline::{digest_file, CorpusPipeline, IndexOrigin, ProcessedCorpus, RebuildReason};
pub use session::Session;
pub use stores::DirectoryBackend;
pub use traits::IndexBackend;
