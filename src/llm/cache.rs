//! Server-side prompt cache for the large, run-constant system
//! instruction. Single-flight creation; any failure degrades to
//! cacheless requests rather than failing the run.

use tokio::sync::Mutex;

use crate::utils::TranslateError;

use super::LlmClient;

#[derive(Debug, Default)]
struct Slot {
    name: Option<String>,
    disabled: bool,
}

pub struct PromptCache {
    enabled: bool,
    ttl_secs: u64,
    slot: Mutex<Slot>,
}

/// How a failed request relates to the cached content it referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFailure {
    /// The cached entry is gone or expired; recreate it next time and
    /// retry this request immediately without cache.
    Invalid,
    /// The backend refuses cached content; stop using the cache entirely.
    Forbidden,
}

impl PromptCache {
    pub fn new(enabled: bool, ttl_secs: u64) -> Self {
        Self {
            enabled,
            ttl_secs,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Returns the cached-content name, creating it on first use. `None`
    /// means run without cache (disabled, or creation failed).
    pub async fn get_or_create(
        &self,
        client: &dyn LlmClient,
        system_instruction: &str,
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let mut slot = self.slot.lock().await;
        if slot.disabled {
            return None;
        }
        if let Some(name) = &slot.name {
            return Some(name.clone());
        }
        match client
            .create_cached_content(system_instruction, self.ttl_secs)
            .await
        {
            Ok(name) => {
                tracing::info!(cache = %name, "prompt cache created");
                slot.name = Some(name.clone());
                Some(name)
            }
            Err(err) => {
                tracing::warn!(error = %err, "prompt cache creation failed, running without cache");
                slot.disabled = true;
                None
            }
        }
    }

    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        slot.name = None;
    }

    pub async fn disable(&self) {
        let mut slot = self.slot.lock().await;
        slot.name = None;
        slot.disabled = true;
    }

    /// Best-effort deletion of the server-side entry at end of run.
    pub async fn teardown(&self, client: &dyn LlmClient) {
        let name = {
            let mut slot = self.slot.lock().await;
            slot.name.take()
        };
        if let Some(name) = name {
            if let Err(err) = client.delete_cached_content(&name).await {
                tracing::debug!(cache = %name, error = %err, "prompt cache delete failed");
            }
        }
    }
}

pub fn classify_cache_error(err: &TranslateError) -> Option<CacheFailure> {
    let TranslateError::Api {
        status, message, ..
    } = err
    else {
        return None;
    };
    let lower = message.to_lowercase();
    let mentions_cache = lower.contains("cachedcontent") || lower.contains("cached content");
    match status {
        403 if mentions_cache || lower.contains("permission_denied") => {
            Some(CacheFailure::Forbidden)
        }
        404 => Some(CacheFailure::Invalid),
        _ if mentions_cache && (lower.contains("expired") || lower.contains("not found")) => {
            Some(CacheFailure::Invalid)
        }
        _ => None,
    }
}
