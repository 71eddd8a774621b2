//! Gemini-style REST backend for [`LlmClient`]. Does no retrying of its
//! own; it surfaces HTTP failures with enough detail (status, message,
//! retry-after) for the run-level retry policy to classify them.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::{ModelConfig, Result, TranslateError};

use super::{GenerateRequest, GenerateResponse, LlmClient};

const ERROR_BODY_LIMIT: usize = 2000;

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            TranslateError::Config(format!("missing API key in ${}", config.api_key_env))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &ModelConfig, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_key,
            model: config.name.clone(),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json<T: Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(TranslateError::Api {
                status: status.as_u16(),
                message,
                retry_after,
            });
        }
        Ok(response.json().await?)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent<'a>>,
    generation_config: WireGenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_content: Option<&'a str>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig<'a> {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<&'a serde_json::Value>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Deserialize)]
struct WireCandidate {
    content: Option<WireResponseContent>,
}

#[derive(Deserialize)]
struct WireResponseContent {
    #[serde(default)]
    parts: Vec<WireResponsePart>,
}

#[derive(Deserialize)]
struct WireResponsePart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let candidate_count = request.candidate_count.max(1);
        let body = WireRequest {
            contents: vec![WireContent {
                role: Some("user"),
                parts: vec![WirePart {
                    text: &request.prompt,
                }],
            }],
            // Cached content already carries the system instruction.
            system_instruction: match (&request.cached_content, &request.system_instruction) {
                (None, Some(sys)) => Some(WireContent {
                    role: None,
                    parts: vec![WirePart { text: sys }],
                }),
                _ => None,
            },
            generation_config: WireGenerationConfig {
                temperature: request.temperature,
                candidate_count: (candidate_count > 1).then_some(candidate_count),
                max_output_tokens: request.max_output_tokens,
                response_mime_type: request
                    .response_schema
                    .is_some()
                    .then_some("application/json"),
                response_schema: request.response_schema.as_ref(),
            },
            cached_content: request.cached_content.as_deref(),
        };

        let raw = self.post_json(&url, &body).await?;
        let parsed: WireResponse = serde_json::from_value(raw)?;
        let candidates: Vec<String> = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<String>()
            })
            .filter(|text| !text.is_empty())
            .collect();

        if candidates.is_empty() {
            return Err(TranslateError::OutputValidation(
                "model returned no text candidates".to_string(),
            ));
        }
        Ok(GenerateResponse { candidates })
    }

    async fn count_tokens(&self, text: &str) -> Result<u32> {
        let url = format!("{}/models/{}:countTokens", self.base_url, self.model);
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": text }] }]
        });
        let raw = self.post_json(&url, &body).await?;
        Ok(raw
            .get("totalTokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32)
    }

    async fn create_cached_content(
        &self,
        system_instruction: &str,
        ttl_secs: u64,
    ) -> Result<String> {
        let url = format!("{}/cachedContents", self.base_url);
        let body = serde_json::json!({
            "model": format!("models/{}", self.model),
            "systemInstruction": { "parts": [{ "text": system_instruction }] },
            "ttl": format!("{ttl_secs}s"),
        });
        let raw = self.post_json(&url, &body).await?;
        raw.get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                TranslateError::OutputValidation("cachedContents response without name".into())
            })
    }

    async fn delete_cached_content(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.base_url, name.trim_start_matches('/'));
        let response = self
            .http
            .delete(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranslateError::Api {
                status: status.as_u16(),
                message: body.chars().take(ERROR_BODY_LIMIT).collect(),
                retry_after: None,
            });
        }
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
