use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use crate::utils::Result;

use super::{GlossaryEntry, ProjectStore, RowRecord, RowUpdate, TmKey};

const ROWS_TABLE: TableDefinition<i64, &[u8]> = TableDefinition::new("rows");
const GLOSSARY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("glossary");
const TM_TABLE: TableDefinition<&str, &str> = TableDefinition::new("translation_memory");
const NOTES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("row_notes");

/// redb-backed [`ProjectStore`]. Row records and glossary entries are
/// serde_json-encoded values; notes are keyed `"{kind}/{id}"`.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(db_path)?;

        // Create all tables up front so read transactions never race an
        // empty database.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ROWS_TABLE)?;
            let _ = write_txn.open_table(GLOSSARY_TABLE)?;
            let _ = write_txn.open_table(TM_TABLE)?;
            let _ = write_txn.open_table(NOTES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn insert_rows(&self, rows: &[RowRecord]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ROWS_TABLE)?;
            for row in rows {
                let data = serde_json::to_vec(row)?;
                table.insert(row.id, data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn note_key(row_id: i64, kind: &str) -> String {
        format!("{kind}/{row_id}")
    }
}

#[async_trait]
impl ProjectStore for RedbStore {
    async fn rows_by_ids(&self, ids: &[i64]) -> Result<Vec<RowRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ROWS_TABLE)?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(data) = table.get(*id)? {
                rows.push(serde_json::from_slice(data.value())?);
            }
        }
        Ok(rows)
    }

    async fn all_rows(&self) -> Result<Vec<RowRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ROWS_TABLE)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, data) = entry?;
            rows.push(serde_json::from_slice(data.value())?);
        }
        Ok(rows)
    }

    async fn apply_updates(&self, updates: &[RowUpdate]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ROWS_TABLE)?;
            for update in updates {
                let existing = match table.get(update.id)? {
                    Some(data) => serde_json::from_slice::<RowRecord>(data.value())?,
                    None => continue,
                };
                let mut row = existing;
                row.status = update.status;
                if let Some(dest) = &update.dest {
                    row.dest = Some(dest.clone());
                }
                row.error = update.error.clone();
                let data = serde_json::to_vec(&row)?;
                table.insert(update.id, data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn glossary(&self) -> Result<Vec<GlossaryEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(GLOSSARY_TABLE)?;
        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (_, data) = entry?;
            entries.push(serde_json::from_slice(data.value())?);
        }
        Ok(entries)
    }

    async fn upsert_glossary_entry(&self, entry: &GlossaryEntry) -> Result<()> {
        let data = serde_json::to_vec(entry)?;
        let key = entry.source.to_lowercase();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(GLOSSARY_TABLE)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn tm_lookup(&self, key: &TmKey) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TM_TABLE)?;
        let storage_key = key.storage_key();
        Ok(table
            .get(storage_key.as_str())?
            .map(|v| v.value().to_string()))
    }

    async fn tm_store(&self, key: &TmKey, translation: &str) -> Result<()> {
        let storage_key = key.storage_key();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TM_TABLE)?;
            table.insert(storage_key.as_str(), translation)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn upsert_note(&self, row_id: i64, kind: &str, text: &str) -> Result<()> {
        let key = Self::note_key(row_id, kind);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(NOTES_TABLE)?;
            table.insert(key.as_str(), text)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn delete_note(&self, row_id: i64, kind: &str) -> Result<()> {
        let key = Self::note_key(row_id, kind);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(NOTES_TABLE)?;
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn notes_of_kind(&self, kind: &str) -> Result<Vec<(i64, String)>> {
        let prefix = format!("{kind}/");
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NOTES_TABLE)?;
        let mut notes = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let key = key.value();
            if let Some(id_part) = key.strip_prefix(&prefix) {
                if let Ok(id) = id_part.parse::<i64>() {
                    notes.push((id, value.value().to_string()));
                }
            }
        }
        Ok(notes)
    }
}
