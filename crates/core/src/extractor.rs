use crate::error::ExtractionError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    /// Reads `LLM_OCR_ENDPOINT` and `LLM_OCR_API_KEY`; `None` when no endpoint is set.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("LLM_OCR_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var("LLM_OCR_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|key| !key.is_empty());

        Some(Self { endpoint, api_key })
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, ExtractionError>;
}

#[derive(Debug, Clone, Default)]
pub struct LopdfExtractor {
    ocr: Option<OcrEndpointConfig>,
    client: Client,
}

impl LopdfExtractor {
    pub fn with_ocr(ocr: Option<OcrEndpointConfig>) -> Self {
        Self {
            ocr,
            client: Client::new(),
        }
    }

    async fn extract_with_llm_ocr(
        &self,
        cfg: &OcrEndpointConfig,
        path: &Path,
    ) -> Result<Vec<PageText>, ExtractionError> {
        let pdf = tokio::fs::read(path).await?;
        let payload = LlmOcrRequest {
            pdf_base64: STANDARD.encode(pdf),
            source_path: path.to_string_lossy().to_string(),
        };

        let mut request = self
            .client
            .post(&cfg.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &cfg.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(ExtractionError::OcrFailed(format!(
                "multimodal OCR request to {} returned {}",
                cfg.endpoint,
                response.status()
            )));
        }

        let payload: LlmOcrResponse = response.json().await?;
        payload_to_pages(&payload, path)
    }
}

#[async_trait]
impl TextExtractor for LopdfExtractor {
    async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, ExtractionError> {
        tokio::fs::metadata(path).await?;

        let owned = path.to_path_buf();
        let parsed = tokio::task::spawn_blocking(move || parse_pages(&owned))
            .await
            .map_err(|error| ExtractionError::Task(error.to_string()))?;

        match (parsed, &self.ocr) {
            (Ok(pages), _) => Ok(pages),
            (Err(error @ (ExtractionError::PdfParse(_) | ExtractionError::NoText(_))), Some(cfg)) => {
                warn!(path = %path.display(), %error, "falling back to multimodal OCR");
                self.extract_with_llm_ocr(cfg, path)
                    .await
                    .map_err(|ocr_error| {
                        ExtractionError::PdfParse(format!(
                            "{error}; multimodal OCR fallback failed: {ocr_error}"
                        ))
                    })
            }
            (Err(error), _) => Err(error),
        }
    }
}

fn parse_pages(path: &Path) -> Result<Vec<PageText>, ExtractionError> {
    let document =
        Document::load(path).map_err(|error| ExtractionError::PdfParse(error.to_string()))?;
    let encrypted = document.trailer.get(b"Encrypt").is_ok();

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document.extract_text(&[page_no]).map_err(|error| {
            if encrypted {
                ExtractionError::Encrypted(format!("{}: {error}", path.display()))
            } else {
                ExtractionError::PdfParse(error.to_string())
            }
        })?;

        pages.push(PageText {
            number: page_no,
            text,
        });
    }

    if pages.iter().all(|page| page.text.trim().is_empty()) {
        if encrypted {
            return Err(ExtractionError::Encrypted(path.display().to_string()));
        }
        return Err(ExtractionError::NoText(path.display().to_string()));
    }

    debug!(path = %path.display(), pages = pages.len(), "parsed pdf pages");
    Ok(pages)
}

/// Joins pages in order, each preceded by a `--- Page N ---` marker line.
pub fn render_pages(pages: &[PageText]) -> String {
    let mut text = String::new();
    for page in pages {
        text.push_str(&format!("\n--- Page {} ---\n", page.number));
        text.push_str(&page.text);
    }
    text
}

pub async fn extract_text<X>(extractor: &X, path: &Path) -> Result<String, ExtractionError>
where
    X: TextExtractor + ?Sized,
{
    let pages = extractor.extract_pages(path).await?;
    let text = render_pages(&pages);
    info!(
        path = %path.display(),
        pages = pages.len(),
        characters = text.chars().count(),
        "extracted document text"
    );
    Ok(text)
}

fn payload_to_pages(payload: &LlmOcrResponse, path: &Path) -> Result<Vec<PageText>, ExtractionError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .enumerate()
            .filter_map(|(index, page)| {
                let normalized = page.text.as_deref()?.trim();
                if normalized.is_empty() {
                    return None;
                }
                Some(PageText {
                    number: page.page.unwrap_or(index as u32 + 1),
                    text: normalized.to_string(),
                })
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let normalized = chunk.trim();
                if normalized.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: normalized.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(ExtractionError::OcrFailed(format!(
        "multimodal OCR response was empty for {}",
        path.display()
    )))
}
