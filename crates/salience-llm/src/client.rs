//! `OpenAiClient`: every salience capability over one HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use salience_core::{
    parse_extraction_response, CapabilityResult, DriftJudge, EmbeddingModel,
    ExtractedQuote, ExtractionModel, ExtractionRequest, SummarizationModel, SummaryRequest,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::OpenAiConfig;
use crate::error::LlmError;
use crate::prompts;

const EXTRACTION_MAX_TOKENS: u32 = 2_000;
const SUMMARY_MAX_TOKENS: u32 = 500;
const JUDGE_MAX_TOKENS: u32 = 10;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible chat/embeddings API
#[derive(Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(OpenAiClient {
            config,
            api_key,
            http,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self, LlmError> {
        Self::new(OpenAiConfig::from_env())
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, LlmError>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let response = self
            .http
            .post(self.config.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<R>().await?)
    }

    /// Single-turn chat completion; returns the first choice's text.
    #[instrument(skip(self, prompt), fields(prompt_chars = prompt.len()))]
    pub async fn chat(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
        json_mode: bool,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
            temperature: 0.0,
            response_format: json_mode.then_some(ResponseFormat { kind: "json_object" }),
        };
        let response: ChatResponse = self.post("chat/completions", &request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Decode("response has no message content".into()))?;
        debug!(reply_chars = content.len(), "chat completion received");
        Ok(content)
    }

    /// Embeddings in input order.
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    pub async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: texts,
        };
        let response: EmbeddingResponse = self.post("embeddings", &request).await?;
        order_embeddings(response.data, texts.len())
    }
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.config.base_url)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

fn order_embeddings(mut data: Vec<EmbeddingDatum>, expected: usize) -> Result<Vec<Vec<f32>>, LlmError> {
    if data.len() != expected {
        return Err(LlmError::Decode(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl ExtractionModel for OpenAiClient {
    async fn extract(&self, request: &ExtractionRequest) -> CapabilityResult<Vec<ExtractedQuote>> {
        let prompt = prompts::extraction_prompt(request);
        let reply = self
            .chat(&self.config.extraction_model, &prompt, EXTRACTION_MAX_TOKENS, true)
            .await?;
        parse_extraction_response(&reply)
    }
}

#[async_trait]
impl SummarizationModel for OpenAiClient {
    async fn summarize(&self, request: &SummaryRequest) -> CapabilityResult<String> {
        let prompt = prompts::background_prompt(&request.text);
        let reply = self
            .chat(&self.config.compression_model, &prompt, SUMMARY_MAX_TOKENS, false)
            .await?;
        Ok(reply.trim().to_string())
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> CapabilityResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.embeddings(texts).await?)
    }
}

#[async_trait]
impl DriftJudge for OpenAiClient {
    async fn goal_coherence(&self, original_goal: &str, stated: &str) -> CapabilityResult<f64> {
        let prompt = prompts::goal_coherence_prompt(original_goal, stated);
        let reply = self
            .chat(&self.config.judge_model, &prompt, JUDGE_MAX_TOKENS, false)
            .await?;
        Ok(prompts::parse_score(&reply)?.clamp(0.0, 1.0))
    }

    async fn constraint_recalled(
        &self,
        constraint: &str,
        statement: &str,
    ) -> CapabilityResult<bool> {
        let prompt = prompts::constraint_recall_prompt(constraint, statement);
        let reply = self
            .chat(&self.config.judge_model, &prompt, JUDGE_MAX_TOKENS, false)
            .await?;
        Ok(prompts::parse_yes_no(&reply)?)
    }

    async fn behavior_alignment(
        &self,
        goal: &str,
        constraints: &[String],
        response: &str,
        test_context: &str,
    ) -> CapabilityResult<u8> {
        let prompt = prompts::behavior_alignment_prompt(goal, constraints, response, test_context);
        let reply = self
            .chat(&self.config.judge_model, &prompt, JUDGE_MAX_TOKENS, false)
            .await?;
        Ok(prompts::parse_alignment(&reply)?)
    }
}
