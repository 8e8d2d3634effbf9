//! Headline classification.
//!
//! A source's category hint is consulted first; only when it is missing or too
//! generic does the refresh cycle pay for a call to the language model.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL};

/// Reply the model is asked to give when a headline fits none of the categories.
pub const NO_MATCH: &str = "OTHER";

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Returns one of `categories` for the headline, or `None` when it fits none.
    async fn classify(&self, headline: &str, categories: &[String]) -> anyhow::Result<Option<String>>;
}

/// Map a source's category hint onto one of the known categories.
///
/// Only unambiguous hints resolve; generic ones ("news", "tech", "science")
/// return `None` so the headline gets classified individually.
pub fn category_from_hint(hint: &str, categories: &[String]) -> Option<String> {
    let hint = hint.to_lowercase();
    let tokens: Vec<&str> = hint
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let has = |word: &str| tokens.iter().any(|t| *t == word);

    let candidate = if has("robotics") {
        "Robotics"
    } else if has("ai") || hint.contains("artificial") || hint.contains("machine learning") {
        "AI"
    } else if has("politics") && (has("us") || hint.contains("united states")) {
        "US Politics"
    } else {
        return None;
    };

    categories
        .iter()
        .find(|c| c.as_str() == candidate)
        .cloned()
}

/// Normalise a model reply and resolve it against the category list.
pub fn match_category(reply: &str, categories: &[String]) -> Option<String> {
    let cleaned = reply
        .replace(['*', '`', '"', '\''], "")
        .trim()
        .trim_end_matches('.')
        .trim()
        .to_string();

    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case(NO_MATCH) {
        return None;
    }

    categories
        .iter()
        .find(|c| c.eq_ignore_ascii_case(&cleaned))
        .cloned()
}

pub fn build_prompt(headline: &str, categories: &[String]) -> String {
    let category_list = categories.join(", ");
    format!(
        "Categorize this news headline into ONE of the following: {list}. \
         If it doesn't fit, respond '{other}'.\n\n\
         Headline: {headline}\n\n\
         Respond with ONLY the category name ({list}) or '{other}'.",
        list = category_list,
        other = NO_MATCH,
        headline = headline,
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// Classifier backed by the Gemini `generateContent` endpoint.
pub struct GeminiClassifier {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl fmt::Debug for GeminiClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClassifier")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GeminiClassifier {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model)
    }

    /// Send a prompt and return the concatenated text of the first candidate.
    async fn generate(&self, prompt: String) -> anyhow::Result<String> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 16,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {}: {}", status, body);
        }

        let body: GenerateResponse = response.json().await?;
        let content = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .ok_or_else(|| anyhow::anyhow!("Gemini response has no candidates"))?;

        Ok(content
            .parts
            .into_iter()
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn classify(&self, headline: &str, categories: &[String]) -> anyhow::Result<Option<String>> {
        if categories.is_empty() {
            return Ok(None);
        }

        let reply = self.generate(build_prompt(headline, categories)).await?;
        debug!("Gemini replied {:?} for '{}'", reply, headline);

        Ok(match_category(&reply, categories))
    }
}
