//! Model access: the [`LlmClient`] trait the pipeline calls, the
//! production Gemini-style REST implementation, and the shared request
//! governors (retry policy, global throttle, adaptive concurrency,
//! prompt cache).

pub mod adaptive;
pub mod cache;
pub mod gemini;
pub mod retry;

use async_trait::async_trait;

use crate::utils::Result;

pub use adaptive::AdaptiveConcurrency;
pub use cache::{classify_cache_error, CacheFailure, PromptCache};
pub use gemini::GeminiClient;
pub use retry::{
    format_error, is_credential_error, is_rate_limit, is_server_error, retry_delay,
    should_retry, GlobalThrottle,
};

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub system_instruction: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub candidate_count: u32,
    /// JSON schema the response must conform to; also forces JSON output.
    pub response_schema: Option<serde_json::Value>,
    /// Server-side cached system prompt, when the prompt cache holds one.
    pub cached_content: Option<String>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub candidates: Vec<String>,
}

impl GenerateResponse {
    pub fn primary(&self) -> Option<&str> {
        self.candidates.first().map(String::as_str)
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;

    /// Token count for sizing long-text chunks; a rough estimate is fine.
    async fn count_tokens(&self, text: &str) -> Result<u32>;

    /// Creates a server-side cached system prompt, returning its name.
    async fn create_cached_content(&self, system_instruction: &str, ttl_secs: u64)
        -> Result<String>;
    async fn delete_cached_content(&self, name: &str) -> Result<()>;

    fn model_name(&self) -> &str;
}
