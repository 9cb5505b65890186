use crate::conversation::ConversationEngine;
use crate::embeddings::Embedder;
use crate::error::SessionError;
use crate::generation::ChatModel;
use crate::index::VectorIndex;
use crate::models::{Transcript, Turn};
use tracing::{info, warn};

/// One conversation: the active index, the engine and the transcript.
pub struct Session<E: ?Sized, G> {
    engine: ConversationEngine<E, G>,
    transcript: Transcript,
    active_index: Option<VectorIndex>,
    ready: bool,
}

impl<E, G> Session<E, G>
where
    E: Embedder + ?Sized,
    G: ChatModel,
{
    pub fn new(engine: ConversationEngine<E, G>) -> Self {
        Self {
            engine,
            transcript: Transcript::new(),
            active_index: None,
            ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn active_index(&self) -> Option<&VectorIndex> {
        self.active_index.as_ref()
    }

    pub fn engine(&self) -> &ConversationEngine<E, G> {
        &self.engine
    }

    pub fn activate(&mut self, index: VectorIndex) {
        info!(
            location = %index.location().display(),
            chunks = index.len(),
            "session activated"
        );
        self.active_index = Some(index);
        self.ready = true;
    }

    /// Forgets the transcript and the active index.
    pub fn reset(&mut self) {
        self.transcript.clear();
        self.active_index = None;
        self.ready = false;
    }

    /// Forgets the transcript but keeps answering from the active index.
    pub fn clear_history(&mut self) {
        self.transcript.clear();
    }

    pub fn record_turn(&mut self, turn: Turn) {
        self.transcript.push(turn);
    }

    /// Answers `question` and records both sides of the exchange.
    ///
    /// A failed answer is recorded as a flagged assistant turn carrying the
    /// error text and returned like any other turn.
    pub async fn ask(&mut self, question: &str) -> Result<Turn, SessionError> {
        let index = match (&self.active_index, self.ready) {
            (Some(index), true) => index,
            _ => return Err(SessionError::NotReady),
        };

        let outcome = self.engine.answer(index, question, &self.transcript).await;

        let reply = match outcome {
            Ok(answer) => Turn::assistant(answer.content, answer.sources),
            Err(error) => {
                warn!(question = error.question(), %error, "turn failed");
                Turn::failure(format!("Error: {error}"))
            }
        };

        self.record_turn(Turn::user(question));
        self.record_turn(reply.clone());
        Ok(reply)
    }
}
