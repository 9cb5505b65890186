use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("chunk overlap {overlap} must be smaller than chunk size {max_chars}")]
    OverlapTooLarge { max_chars: usize, overlap: usize },

    #[error("retrieval k must be at least 1")]
    ZeroTopK,

    #[error("embedding batch size must be at least 1")]
    ZeroBatchSize,

    #[error("unsupported generation model: {0}")]
    UnknownModel(String),

    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error("missing api key for {0}")]
    MissingApiKey(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("pdf is encrypted: {0}")]
    Encrypted(String),

    #[error("pdf had no readable page text: {0}")]
    NoText(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),

    #[error("extraction task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("invalid embedding response: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("invalid generation response: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no persisted index at {}", location.display())]
    NotFound { location: PathBuf },

    #[error("index at {} is corrupt: {details}", location.display())]
    Corrupt { location: PathBuf, details: String },

    #[error(
        "index at {} was built with embedder {found}, expected {expected}",
        location.display()
    )]
    EmbedderMismatch {
        location: PathBuf,
        expected: String,
        found: String,
    },

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("io error at {}: {source}", location.display())]
    Io {
        location: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl IndexError {
    pub(crate) fn io(location: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            location: location.into(),
            source,
        }
    }

    pub(crate) fn corrupt(location: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        Self::Corrupt {
            location: location.into(),
            details: details.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to extract {}: {source}", path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: ExtractionError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build index for {}: {source}", path.display())]
    Index {
        path: PathBuf,
        #[source]
        source: IndexError,
    },
}

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("retrieval failed for {question:?}: {source}")]
    Retrieval {
        question: String,
        #[source]
        source: IndexError,
    },

    #[error("generation failed for {question:?}: {source}")]
    Generation {
        question: String,
        #[source]
        source: GenerationError,
    },

    #[error("invalid question {question:?}: {reason}")]
    InvalidQuestion { question: String, reason: String },
}

impl AnswerError {
    pub fn question(&self) -> &str {
        match self {
            Self::Retrieval { question, .. }
            | Self::Generation { question, .. }
            | Self::InvalidQuestion { question, .. } => question,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has no active index; process a document first")]
    NotReady,
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
