use crate::embeddings::endpoint_url;
use crate::error::{ConfigError, GenerationError};
use crate::models::{GenerationModel, PromptMessage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(&self, messages: &[PromptMessage]) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: GenerationModel,
    temperature: f32,
}

impl OpenAiChatModel {
    pub fn new(
        api_key: impl Into<String>,
        base_url: &str,
        model: GenerationModel,
        temperature: f32,
    ) -> Result<Self, ConfigError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey("OpenAI chat".to_string()));
        }
        Ok(Self {
            client: Client::new(),
            endpoint: endpoint_url(base_url, "chat/completions")?,
            api_key,
            model,
            temperature,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model(&self) -> &str {
        self.model.as_str()
    }

    async fn generate(&self, messages: &[PromptMessage]) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model: self.model.as_str(),
            temperature: self.temperature,
            messages: messages
                .iter()
                .map(|message| ChatMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.api_key.trim())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(GenerationError::Status {
                provider: "openai".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        first_content(parsed)
    }
}

fn first_content(parsed: ChatResponse) -> Result<String, GenerationError> {
    parsed
        .choices
        .into_iter()
        .find_map(|choice| choice.message.content)
        .ok_or_else(|| GenerationError::Response("response had no message content".to_string()))
}
