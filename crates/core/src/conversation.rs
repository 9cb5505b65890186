use crate::embeddings::Embedder;
use crate::error::{AnswerError, ConfigError};
use crate::generation::ChatModel;
use crate::index::VectorIndex;
use crate::models::{Answer, PromptMessage, Role, TextChunk, Transcript, Turn};
use std::sync::Arc;
use tracing::debug;

pub const SYSTEM_PROMPT: &str = "You are an assistant answering questions about a single document. \
Use the numbered document excerpts below as your only source of facts and cite them as [n] when you rely on them. \
If the excerpts do not contain the answer, say that the document does not cover it instead of guessing.";

const NO_EXCERPTS: &str = "No relevant excerpts were found in the document.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub top_k: usize,
    pub history_turns: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            history_turns: 10,
        }
    }
}

/// Answers questions against an index, conditioned on the history it is handed.
pub struct ConversationEngine<E: ?Sized, G> {
    embedder: Arc<E>,
    generator: G,
    config: EngineConfig,
}

impl<E, G> ConversationEngine<E, G>
where
    E: Embedder + ?Sized,
    G: ChatModel,
{
    pub fn new(embedder: Arc<E>, generator: G, config: EngineConfig) -> Result<Self, ConfigError> {
        if config.top_k == 0 {
            return Err(ConfigError::ZeroTopK);
        }
        Ok(Self {
            embedder,
            generator,
            config,
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn embedder(&self) -> &Arc<E> {
        &self.embedder
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub async fn answer(
        &self,
        index: &VectorIndex,
        question: &str,
        transcript: &Transcript,
    ) -> Result<Answer, AnswerError> {
        if question.trim().is_empty() {
            return Err(AnswerError::InvalidQuestion {
                question: question.to_string(),
                reason: "question is empty".to_string(),
            });
        }

        let hits = index
            .query(self.embedder.as_ref(), question, self.config.top_k)
            .await
            .map_err(|source| AnswerError::Retrieval {
                question: question.to_string(),
                source,
            })?;
        let sources = hits.into_iter().map(|hit| hit.chunk).collect::<Vec<_>>();

        let messages = compose_prompt(&sources, transcript, question, self.config.history_turns);
        debug!(
            sources = sources.len(),
            messages = messages.len(),
            model = self.generator.model(),
            "generating answer"
        );

        let content = self
            .generator
            .generate(&messages)
            .await
            .map_err(|source| AnswerError::Generation {
                question: question.to_string(),
                source,
            })?;

        Ok(Answer { content, sources })
    }
}

/// Instruction and excerpts, then recent history, then the new question.
pub fn compose_prompt(
    sources: &[TextChunk],
    transcript: &Transcript,
    question: &str,
    history_turns: usize,
) -> Vec<PromptMessage> {
    let mut system = format!("{SYSTEM_PROMPT}\n\nDocument excerpts:\n");
    if sources.is_empty() {
        system.push_str(NO_EXCERPTS);
    }
    for (position, chunk) in sources.iter().enumerate() {
        match chunk.page {
            Some(page) => system.push_str(&format!("\n[{}] (page {page})\n", position + 1)),
            None => system.push_str(&format!("\n[{}]\n", position + 1)),
        }
        system.push_str(chunk.content.trim());
        system.push('\n');
    }

    let mut messages = vec![PromptMessage::new(Role::System, system)];
    messages.extend(
        history_window(transcript.turns(), history_turns)
            .into_iter()
            .map(|turn| PromptMessage::new(turn.role, turn.content.clone())),
    );
    messages.push(PromptMessage::new(Role::User, question));
    messages
}

/// At most `limit` recent turns, leaving out failed answers and the questions behind them.
fn history_window(turns: &[Turn], limit: usize) -> Vec<&Turn> {
    let mut kept: Vec<&Turn> = Vec::with_capacity(turns.len());
    for turn in turns {
        if turn.failed {
            if kept.last().is_some_and(|previous| previous.role == Role::User) {
                kept.pop();
            }
            continue;
        }
        kept.push(turn);
    }

    let mut skip = kept.len().saturating_sub(limit);
    // An answer whose question fell outside the window is dropped too.
    if kept.get(skip).is_some_and(|turn| turn.role == Role::Assistant) {
        skip += 1;
    }
    kept.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::GenerationError;
    use crate::index::{IndexEntry, IndexMetadata, INDEX_FORMAT_VERSION};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingModel {
        prompts: Mutex<Vec<Vec<PromptMessage>>>,
    }

    #[async_trait]
    impl ChatModel for RecordingModel {
        fn model(&self) -> &str {
            "recording"
        }

        async fn generate(&self, messages: &[PromptMessage]) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            Ok("The pump delivers 10 bar [1].".to_string())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        fn model(&self) -> &str {
            "failing"
        }

        async fn generate(&self, _messages: &[PromptMessage]) -> Result<String, GenerationError> {
            Err(GenerationError::Status {
                provider: "openai".to_string(),
                status: 429,
                body: "rate limited".to_string(),
            })
        }
    }

    fn in_memory_index(embedder: &CharacterNgramEmbedder, texts: &[&str]) -> VectorIndex {
        let entries = texts
            .iter()
            .enumerate()
            .map(|(ordinal, text)| IndexEntry {
                chunk: TextChunk {
                    content: text.to_string(),
                    source_ordinal: ordinal as u64,
                    start: 0,
                    end: text.chars().count(),
                    page: Some(ordinal as u32 + 1),
                },
                embedding: embedder.embed_text(text),
            })
            .collect::<Vec<_>>();
        VectorIndex::from_parts(
            PathBuf::from("memory"),
            IndexMetadata {
                format_version: INDEX_FORMAT_VERSION,
                embedder: embedder.identifier(),
                dimensions: Some(embedder.dimensions),
                chunking: None,
                document_checksum: None,
                source_path: None,
                chunk_count: entries.len(),
                build_id: Uuid::new_v4(),
                created_at: Utc::now(),
            },
            entries,
        )
    }

    fn manual_index(embedder: &CharacterNgramEmbedder) -> VectorIndex {
        in_memory_index(
            embedder,
            &[
                "The hydraulic pump delivers 10 bar.",
                "Replace the valve seal every 500 hours.",
                "Wiring diagrams are in appendix C.",
                "The pump housing is cast iron.",
            ],
        )
    }

    fn engine<G: ChatModel>(generator: G, history_turns: usize) -> ConversationEngine<CharacterNgramEmbedder, G> {
        ConversationEngine::new(
            Arc::new(CharacterNgramEmbedder::default()),
            generator,
            EngineConfig {
                top_k: 3,
                history_turns,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn answer_returns_retrieved_sources_in_order() {
        let engine = engine(RecordingModel::default(), 10);
        let index = manual_index(engine.embedder());

        let answer = engine
            .answer(&index, "What pressure does the hydraulic pump deliver?", &Transcript::new())
            .await
            .unwrap();

        assert_eq!(answer.content, "The pump delivers 10 bar [1].");
        assert_eq!(answer.sources.len(), 3);
        assert_eq!(answer.sources[0].source_ordinal, 0);

        let prompts = engine.generator().prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, Role::System);
        assert!(prompt[0].content.contains("[1] (page 1)\nThe hydraulic pump delivers 10 bar."));
        assert_eq!(
            prompt[1],
            PromptMessage::new(Role::User, "What pressure does the hydraulic pump deliver?")
        );
    }

    #[tokio::test]
    async fn history_is_supplied_per_call() {
        let engine = engine(RecordingModel::default(), 10);
        let index = manual_index(engine.embedder());
        let empty = Transcript::new();
        let earlier = Transcript::from(vec![
            Turn::user("Tell me about the pump."),
            Turn::assistant("It delivers 10 bar.", Vec::new()),
        ]);

        let first = engine.answer(&index, "And the seal?", &empty).await.unwrap();
        let second = engine.answer(&index, "And the seal?", &earlier).await.unwrap();

        assert!(!first.sources.is_empty());
        assert!(!second.sources.is_empty());
        let prompts = engine.generator().prompts.lock().unwrap();
        assert_ne!(prompts[0], prompts[1]);
        assert_eq!(prompts[1][1], PromptMessage::new(Role::User, "Tell me about the pump."));
        assert_eq!(prompts[1][2], PromptMessage::new(Role::Assistant, "It delivers 10 bar."));
    }

    #[tokio::test]
    async fn history_window_is_bounded() {
        let engine = engine(RecordingModel::default(), 4);
        let index = manual_index(engine.embedder());
        let mut transcript = Transcript::new();
        for round in 0..15 {
            transcript.push(Turn::user(format!("question {round}")));
            transcript.push(Turn::assistant(format!("answer {round}"), Vec::new()));
        }

        engine.answer(&index, "latest?", &transcript).await.unwrap();

        let prompts = engine.generator().prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert_eq!(prompt.len(), 6);
        assert_eq!(prompt[1].content, "question 13");
        assert_eq!(prompt[4].content, "answer 14");
    }

    #[test]
    fn odd_window_does_not_start_with_an_answer() {
        let transcript = Transcript::from(vec![
            Turn::user("question 1"),
            Turn::assistant("answer 1", Vec::new()),
            Turn::user("question 2"),
            Turn::assistant("answer 2", Vec::new()),
        ]);

        let prompt = compose_prompt(&[], &transcript, "question 3", 3);
        let history = prompt[1..prompt.len() - 1]
            .iter()
            .map(|message| (message.role, message.content.as_str()))
            .collect::<Vec<_>>();

        assert_eq!(
            history,
            vec![(Role::User, "question 2"), (Role::Assistant, "answer 2")]
        );
    }

    #[test]
    fn failed_exchanges_are_left_out_of_history() {
        let transcript = Transcript::from(vec![
            Turn::user("first"),
            Turn::assistant("ok", Vec::new()),
            Turn::user("second"),
            Turn::failure("Error: timeout"),
            Turn::user("third"),
            Turn::assistant("fine", Vec::new()),
        ]);

        let prompt = compose_prompt(&[], &transcript, "fourth", 10);
        let history = prompt[1..prompt.len() - 1]
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();

        assert_eq!(history, vec!["first", "ok", "third", "fine"]);
        assert!(prompt[0].content.contains(NO_EXCERPTS));
    }

    #[tokio::test]
    async fn generation_failure_keeps_the_question() {
        let engine = engine(FailingModel, 10);
        let index = manual_index(engine.embedder());

        let error = engine
            .answer(&index, "Where are the wiring diagrams?", &Transcript::new())
            .await
            .unwrap_err();

        assert!(matches!(error, AnswerError::Generation { .. }));
        assert_eq!(error.question(), "Where are the wiring diagrams?");
    }

    #[tokio::test]
    async fn empty_index_answers_without_sources() {
        let engine = engine(RecordingModel::default(), 10);
        let index = in_memory_index(engine.embedder(), &[]);

        let answer = engine.answer(&index, "Anything?", &Transcript::new()).await.unwrap();

        assert!(answer.sources.is_empty());
        let prompts = engine.generator().prompts.lock().unwrap();
        assert!(prompts[0][0].content.contains(NO_EXCERPTS));
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let engine = engine(RecordingModel::default(), 10);
        let index = manual_index(engine.embedder());
        let error = engine.answer(&index, "   ", &Transcript::new()).await.unwrap_err();
        assert!(matches!(error, AnswerError::InvalidQuestion { .. }));
    }

    #[test]
    fn zero_top_k_is_a_config_error() {
        let result = ConversationEngine::new(
            Arc::new(CharacterNgramEmbedder::default()),
            FailingModel,
            EngineConfig {
                top_k: 0,
                history_turns: 1,
            },
        );
        assert!(matches!(result, Err(ConfigError::ZeroTopK)));
    }
}
