use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pdf_chat_core::{
    CharacterNgramEmbedder, ChatOptions, ConversationEngine, CorpusPipeline, DirectoryBackend,
    Embedder, GenerationModel, IndexOrigin, IndexStore, LopdfExtractor, OcrEndpointConfig,
    OpenAiChatModel, OpenAiEmbedder, Session, Turn, VectorIndex, DEFAULT_INDEX_LOCATION,
    DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_EMBEDDING_MODEL,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SOURCE_PREVIEW_CHARS: usize = 300;

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    /// OpenAI-compatible embeddings endpoint.
    Openai,
    /// Offline character-trigram hashing, no API key needed.
    Ngram,
}

#[derive(Parser)]
#[command(name = "pdf-chat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// PDF document to talk about
    #[arg(long, default_value = "document.pdf")]
    document: PathBuf,

    /// Directory holding the persisted index
    #[arg(long, default_value = DEFAULT_INDEX_LOCATION)]
    index_location: PathBuf,

    /// Maximum characters per chunk
    #[arg(long, default_value_t = 1_000)]
    chunk_max_chars: usize,

    /// Characters shared by neighbouring chunks
    #[arg(long, default_value_t = 200)]
    chunk_overlap: usize,

    /// Chunks retrieved per question
    #[arg(long, default_value_t = 3)]
    top_k: usize,

    /// Previous turns replayed into each prompt
    #[arg(long, default_value_t = 10)]
    history_turns: usize,

    /// Generation model (gpt-3.5-turbo, gpt-4, gpt-4-turbo-preview)
    #[arg(long, default_value = "gpt-3.5-turbo")]
    model: GenerationModel,

    /// Sampling temperature for generation
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    /// Embedding backend
    #[arg(long, value_enum, default_value = "openai")]
    embedder: EmbedderKind,

    /// Embedding model name for the OpenAI backend
    #[arg(long, default_value = DEFAULT_OPENAI_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Chunks sent per embedding request
    #[arg(long, default_value_t = 64)]
    embedding_batch_size: usize,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    openai_base_url: String,
}

#[derive(Subcommand)]
enum Command {
    /// Build the index for the document, or confirm the persisted one is current.
    Index {
        /// Rebuild even when a matching index exists.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Answer a single question and print its sources.
    Ask {
        /// Question about the document
        #[arg(long)]
        question: String,
        /// Rebuild the index before answering.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Interactive conversation. Commands: /clear, /reset, /history, /quit.
    Chat {
        /// Rebuild the index before starting.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

impl Cli {
    fn options(&self) -> ChatOptions {
        ChatOptions {
            chunk_max_chars: self.chunk_max_chars,
            chunk_overlap_chars: self.chunk_overlap,
            retrieval_k: self.top_k,
            history_turns: self.history_turns,
            generation_model: self.model,
            temperature: self.temperature,
            embedding_batch_size: self.embedding_batch_size,
            index_location: self.index_location.clone(),
        }
    }

    fn api_key(&self) -> anyhow::Result<String> {
        self.openai_api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .context("an OpenAI API key is required (--openai-api-key or OPENAI_API_KEY)")
    }

    fn embedder(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        let embedder: Arc<dyn Embedder> = match self.embedder {
            EmbedderKind::Openai => Arc::new(OpenAiEmbedder::new(
                self.api_key()?,
                &self.openai_base_url,
                self.embedding_model.clone(),
            )?),
            EmbedderKind::Ngram => Arc::new(CharacterNgramEmbedder::default()),
        };
        Ok(embedder)
    }

    fn session(
        &self,
        options: &ChatOptions,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<Session<dyn Embedder, OpenAiChatModel>> {
        let generator = OpenAiChatModel::new(
            self.api_key()?,
            &self.openai_base_url,
            options.generation_model,
            options.temperature,
        )?;
        let engine = ConversationEngine::new(embedder, generator, options.engine())?;
        Ok(Session::new(engine))
    }
}

async fn prepare_index(
    cli: &Cli,
    options: &ChatOptions,
    embedder: &dyn Embedder,
    force: bool,
) -> anyhow::Result<VectorIndex> {
    let store = IndexStore::new(DirectoryBackend::new()).with_batch_size(options.embedding_batch_size)?;
    let pipeline = CorpusPipeline::new(LopdfExtractor::with_ocr(OcrEndpointConfig::from_env()), store);

    let processing = pipeline.process_detailed(
        &cli.document,
        &options.index_location,
        embedder,
        options.chunking(),
        force,
    );

    let processed = tokio::select! {
        result = processing => result?,
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("indexing cancelled; any previously persisted index is unchanged")
        }
    };

    match &processed.origin {
        IndexOrigin::Reused => println!(
            "reusing index at {} ({} chunks)",
            options.index_location.display(),
            processed.index.len()
        ),
        IndexOrigin::Rebuilt(reason) => println!(
            "built index at {} ({} chunks): {reason}",
            options.index_location.display(),
            processed.index.len()
        ),
    }

    Ok(processed.index)
}

fn print_turn(turn: &Turn) {
    println!("{}", turn.content);
    for (position, source) in turn.sources.iter().enumerate() {
        let page = source
            .page
            .map(|page| format!("page {page}"))
            .unwrap_or_else(|| "page ?".to_string());
        println!(
            "  [{}] {page}: {}",
            position + 1,
            source.preview(SOURCE_PREVIEW_CHARS).replace('\n', " ")
        );
    }
}

fn print_history(turns: &[Turn]) {
    for turn in turns {
        println!(
            "{} {:>9}: {}",
            turn.created_at.format("%H:%M:%S"),
            turn.role.as_str(),
            turn.content
        );
    }
}

async fn chat(cli: &Cli, options: &ChatOptions, force: bool) -> anyhow::Result<()> {
    let embedder = cli.embedder()?;
    let mut session = cli.session(options, embedder.clone())?;
    session.activate(prepare_index(cli, options, embedder.as_ref(), force).await?);

    println!("Ask about {}. Commands: /clear, /reset, /history, /quit", cli.document.display());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                session.clear_history();
                println!("history cleared");
            }
            "/history" => print_history(session.transcript().turns()),
            "/reset" => {
                session.reset();
                let index = prepare_index(cli, options, embedder.as_ref(), false).await?;
                session.activate(index);
                println!("session reset");
            }
            question => {
                let turn = session.ask(question).await?;
                if turn.failed {
                    warn!("answer failed; you can ask again");
                }
                print_turn(&turn);
            }
        }
    }

    info!(turns = session.transcript().len(), "chat ended");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let options = cli.options();
    options.validate()?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        document = %cli.document.display(),
        model = %options.generation_model,
        "pdf-chat boot"
    );

    match &cli.command {
        Command::Index { force } => {
            let embedder = cli.embedder()?;
            prepare_index(&cli, &options, embedder.as_ref(), *force).await?;
        }
        Command::Ask { question, force } => {
            let embedder = cli.embedder()?;
            let mut session = cli.session(&options, embedder.clone())?;
            session.activate(prepare_index(&cli, &options, embedder.as_ref(), *force).await?);
            let turn = session.ask(question).await?;
            print_turn(&turn);
            if turn.failed {
                anyhow::bail!("question could not be answered");
            }
        }
        Command::Chat { force } => chat(&cli, &options, *force).await?,
    }

    Ok(())
}
