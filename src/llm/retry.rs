//! Retry classification and pacing for model requests. One policy for the
//! whole run: rate limits stretch delays and extend the shared throttle,
//! credential failures abort, validation failures never retry.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::utils::TranslateError;

const MAX_TOTAL_DELAY: Duration = Duration::from_secs(10 * 60);
const MAX_JITTER_MS: f64 = 5000.0;
const ERROR_MESSAGE_LIMIT: usize = 800;

pub fn is_rate_limit(err: &TranslateError) -> bool {
    if let TranslateError::Api { status: 429, .. } = err {
        return true;
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("429")
        || msg.contains("too many")
        || (msg.contains("rate") && msg.contains("limit"))
        || msg.contains("resource_exhausted")
}

pub fn is_credential_error(err: &TranslateError) -> bool {
    matches!(err, TranslateError::Api { status: 401 | 403, .. })
}

pub fn is_server_error(err: &TranslateError) -> bool {
    if let TranslateError::Api { status, .. } = err {
        if (500..=599).contains(status) {
            return true;
        }
    }
    let msg = err.to_string();
    ["HTTP 500", "HTTP 502", "HTTP 503", "HTTP 504"]
        .iter()
        .any(|needle| msg.contains(needle))
}

pub fn should_retry(err: &TranslateError) -> bool {
    if err.is_output_validation() {
        return false;
    }
    match err {
        TranslateError::Network(_) | TranslateError::Timeout => true,
        TranslateError::Api { .. } => is_rate_limit(err) || is_server_error(err),
        _ => false,
    }
}

pub fn retry_after(err: &TranslateError) -> Option<Duration> {
    match err {
        TranslateError::Api {
            retry_after: Some(ra),
            ..
        } if *ra > Duration::ZERO => Some(*ra),
        _ => None,
    }
}

/// Base schedule grows gently, rate limits grow steeply; a server-sent
/// retry-after wins when larger. Jitter spreads concurrent workers out.
pub fn retry_delay(err: &TranslateError, attempt: u32) -> Duration {
    let base_seconds = if is_rate_limit(err) {
        (10 * (attempt + 1) as u64).min(90) as f64
    } else {
        (1.5 * attempt as f64 + 1.0).min(30.0)
    };

    let mut delay = Duration::from_secs_f64(base_seconds);
    if let Some(ra) = retry_after(err) {
        if ra > delay {
            delay = ra;
        }
    }
    add_jitter(delay)
}

fn add_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let ms = delay.as_millis() as f64;
    let max_extra = MAX_JITTER_MS.min(ms * 0.20);
    let extra = rand::thread_rng().gen::<f64>() * max_extra;
    Duration::from_millis((ms + extra) as u64).min(MAX_TOTAL_DELAY)
}

/// Row-note and log friendly error text, truncated to a sane length.
pub fn format_error(err: &TranslateError) -> String {
    let text = err.to_string();
    if text.chars().count() <= ERROR_MESSAGE_LIMIT {
        return text;
    }
    text.chars().take(ERROR_MESSAGE_LIMIT).collect()
}

/// Run-wide pause shared by every worker. A rate limit anywhere extends a
/// single resume-at timestamp; extensions only ever push it later.
#[derive(Debug, Default)]
pub struct GlobalThrottle {
    until_unix_ms: AtomicI64,
}

impl GlobalThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, delay: Duration) {
        let target = now_unix_ms() + delay.as_millis() as i64;
        let mut current = self.until_unix_ms.load(Ordering::Acquire);
        while target > current {
            match self.until_unix_ms.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::warn!(delay_ms = delay.as_millis() as u64, "global throttle extended");
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub async fn wait(&self) {
        loop {
            let until = self.until_unix_ms.load(Ordering::Acquire);
            let now = now_unix_ms();
            if until <= now {
                return;
            }
            tokio::time::sleep(Duration::from_millis((until - now) as u64)).await;
        }
    }

    pub fn remaining(&self) -> Duration {
        let until = self.until_unix_ms.load(Ordering::Acquire);
        let now = now_unix_ms();
        if until <= now {
            Duration::ZERO
        } else {
            Duration::from_millis((until - now) as u64)
        }
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
