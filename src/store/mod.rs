//! Project persistence: translation rows, glossary, translation memory
//! and per-row notes. The orchestrator only talks to the [`ProjectStore`]
//! trait; `redb_store` is the on-disk implementation and `memory` backs
//! tests.

pub mod memory;
pub mod redb_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::Result;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowStatus {
    Pending,
    InProgress,
    Done,
    Error,
    Skipped,
    Edited,
}

impl RowStatus {
    /// Rows a run may pick up. Edited rows are user-owned and never
    /// re-entered; Done/Skipped rows are settled.
    pub fn is_translatable(self) -> bool {
        matches!(self, RowStatus::Pending | RowStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: i64,
    pub source: String,
    pub dest: Option<String>,
    pub status: RowStatus,
    /// Record type tag from the plugin, e.g. "WEAP:FULL" or "INFO:NAM1".
    pub rec: Option<String>,
    /// Editor id of the owning record.
    pub edid: Option<String>,
    /// Position in the string list; dialogue context uses adjacency.
    pub order: i64,
    pub error: Option<String>,
}

/// One transactional row mutation. `dest: None` leaves the existing
/// translation untouched; `error` is stored as given (callers clear it by
/// passing `None` on non-error statuses).
#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub id: i64,
    pub status: RowStatus,
    pub dest: Option<String>,
    pub error: Option<String>,
}

impl RowUpdate {
    pub fn status_only(id: i64, status: RowStatus) -> Self {
        Self {
            id,
            status,
            dest: None,
            error: None,
        }
    }

    pub fn done(id: i64, dest: String) -> Self {
        Self {
            id,
            status: RowStatus::Done,
            dest: Some(dest),
            error: None,
        }
    }

    pub fn failed(id: i64, message: String) -> Self {
        Self {
            id,
            status: RowStatus::Error,
            dest: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
    /// Prompt-only entries are hints; they are not enforced as tokens.
    pub prompt_only: bool,
}

/// Translation-memory lookup key, normalized so trivially different
/// sources (case, CRLF, surrounding space) share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TmKey {
    pub source_lang: String,
    pub target_lang: String,
    pub normalized_source: String,
}

impl TmKey {
    pub fn new(source_lang: &str, target_lang: &str, source_text: &str) -> Self {
        Self {
            source_lang: source_lang.trim().to_lowercase(),
            target_lang: target_lang.trim().to_lowercase(),
            normalized_source: normalize_tm_source(source_text),
        }
    }

    pub fn storage_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.source_lang, self.target_lang, self.normalized_source
        )
    }
}

pub fn normalize_tm_source(source_text: &str) -> String {
    source_text
        .trim()
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .to_lowercase()
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn rows_by_ids(&self, ids: &[i64]) -> Result<Vec<RowRecord>>;
    async fn all_rows(&self) -> Result<Vec<RowRecord>>;
    async fn apply_updates(&self, updates: &[RowUpdate]) -> Result<()>;

    async fn glossary(&self) -> Result<Vec<GlossaryEntry>>;
    async fn upsert_glossary_entry(&self, entry: &GlossaryEntry) -> Result<()>;

    async fn tm_lookup(&self, key: &TmKey) -> Result<Option<String>>;
    async fn tm_store(&self, key: &TmKey, translation: &str) -> Result<()>;

    async fn upsert_note(&self, row_id: i64, kind: &str, text: &str) -> Result<()>;
    async fn delete_note(&self, row_id: i64, kind: &str) -> Result<()>;
    async fn notes_of_kind(&self, kind: &str) -> Result<Vec<(i64, String)>>;
}
