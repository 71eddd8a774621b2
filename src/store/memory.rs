use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::utils::Result;

use super::{GlossaryEntry, ProjectStore, RowRecord, RowStatus, RowUpdate, TmKey};

/// In-memory [`ProjectStore`] used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<i64, RowRecord>,
    glossary: Vec<GlossaryEntry>,
    tm: HashMap<String, String>,
    notes: HashMap<(i64, String), String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = RowRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            for row in rows {
                inner.rows.insert(row.id, row);
            }
        }
        store
    }

    pub fn insert_row(&self, row: RowRecord) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rows.insert(row.id, row);
        }
    }

    pub fn insert_glossary(&self, entry: GlossaryEntry) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.glossary.push(entry);
        }
    }

    pub fn seed_tm(&self, key: &TmKey, translation: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tm.insert(key.storage_key(), translation.to_string());
        }
    }

    pub fn row(&self, id: i64) -> Option<RowRecord> {
        self.inner.lock().ok().and_then(|inner| inner.rows.get(&id).cloned())
    }

    pub fn rows_with_status(&self, status: RowStatus) -> Vec<RowRecord> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .rows
                    .values()
                    .filter(|r| r.status == status)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn note(&self, row_id: i64, kind: &str) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.notes.get(&(row_id, kind.to_string())).cloned())
    }

    fn locked<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| crate::utils::TranslateError::Database("store poisoned".into()))?;
        Ok(f(&mut inner))
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn rows_by_ids(&self, ids: &[i64]) -> Result<Vec<RowRecord>> {
        self.locked(|inner| {
            ids.iter()
                .filter_map(|id| inner.rows.get(id).cloned())
                .collect()
        })
    }

    async fn all_rows(&self) -> Result<Vec<RowRecord>> {
        self.locked(|inner| inner.rows.values().cloned().collect())
    }

    async fn apply_updates(&self, updates: &[RowUpdate]) -> Result<()> {
        self.locked(|inner| {
            for update in updates {
                if let Some(row) = inner.rows.get_mut(&update.id) {
                    row.status = update.status;
                    if let Some(dest) = &update.dest {
                        row.dest = Some(dest.clone());
                    }
                    row.error = update.error.clone();
                }
            }
        })
    }

    async fn glossary(&self) -> Result<Vec<GlossaryEntry>> {
        self.locked(|inner| inner.glossary.clone())
    }

    async fn upsert_glossary_entry(&self, entry: &GlossaryEntry) -> Result<()> {
        self.locked(|inner| {
            if let Some(existing) = inner
                .glossary
                .iter_mut()
                .find(|e| e.source.eq_ignore_ascii_case(&entry.source))
            {
                *existing = entry.clone();
            } else {
                inner.glossary.push(entry.clone());
            }
        })
    }

    async fn tm_lookup(&self, key: &TmKey) -> Result<Option<String>> {
        self.locked(|inner| inner.tm.get(&key.storage_key()).cloned())
    }

    async fn tm_store(&self, key: &TmKey, translation: &str) -> Result<()> {
        self.locked(|inner| {
            inner.tm.insert(key.storage_key(), translation.to_string());
        })
    }

    async fn upsert_note(&self, row_id: i64, kind: &str, text: &str) -> Result<()> {
        self.locked(|inner| {
            inner
                .notes
                .insert((row_id, kind.to_string()), text.to_string());
        })
    }

    async fn delete_note(&self, row_id: i64, kind: &str) -> Result<()> {
        self.locked(|inner| {
            inner.notes.remove(&(row_id, kind.to_string()));
        })
    }

    async fn notes_of_kind(&self, kind: &str) -> Result<Vec<(i64, String)>> {
        self.locked(|inner| {
            inner
                .notes
                .iter()
                .filter(|((_, k), _)| k == kind)
                .map(|((id, _), text)| (*id, text.clone()))
                .collect()
        })
    }
}
