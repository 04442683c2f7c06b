use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{error::Result, model::ProjectId};

const INDEXES: TableDefinition<u64, &[u8]> = TableDefinition::new("indexes");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

const INDEX_SEQUENCE: &str = "index";

/// The persisted index row. There is at most one per project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: u64,
    pub project: ProjectId,
    /// Identifier of the provider that built the physical index.
    pub provider: String,
    /// Whether the index lags behind the project's documents.
    pub invalid: bool,
}

pub struct IndexDb {
    db: Database,
}

impl IndexDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(INDEXES)?;
        txn.open_table(SEQUENCES)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Index records --

    pub fn get_index(&self, project: ProjectId) -> Result<Option<IndexRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INDEXES)?;
        match table.get(project.0)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Read the project's index record, creating it if absent.
    ///
    /// New records start out invalid: nothing has been indexed yet.
    pub fn get_or_create_index(
        &self,
        project: ProjectId,
        provider: &str,
    ) -> Result<IndexRecord> {
        let txn = self.db.begin_write()?;
        let record = {
            let mut indexes = txn.open_table(INDEXES)?;
            let existing: Option<IndexRecord> = match indexes.get(project.0)? {
                Some(v) => Some(serde_json::from_slice(v.value())?),
                None => None,
            };
            match existing {
                Some(record) => record,
                None => {
                    let mut sequences = txn.open_table(SEQUENCES)?;
                    let id = sequences
                        .get(INDEX_SEQUENCE)?
                        .map(|v| v.value())
                        .unwrap_or(0)
                        + 1;
                    sequences.insert(INDEX_SEQUENCE, id)?;

                    let record = IndexRecord {
                        id,
                        project,
                        provider: provider.to_string(),
                        invalid: true,
                    };
                    let bytes = serde_json::to_vec(&record)?;
                    indexes.insert(project.0, bytes.as_slice())?;
                    record
                }
            }
        };
        txn.commit()?;
        Ok(record)
    }

    /// Update the invalid flag. Returns `false` if the project has no record.
    pub fn set_invalid(&self, project: ProjectId, invalid: bool) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let updated = {
            let mut table = txn.open_table(INDEXES)?;
            let existing: Option<IndexRecord> = match table.get(project.0)? {
                Some(v) => Some(serde_json::from_slice(v.value())?),
                None => None,
            };
            match existing {
                Some(mut record) => {
                    record.invalid = invalid;
                    let bytes = serde_json::to_vec(&record)?;
                    table.insert(project.0, bytes.as_slice())?;
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(updated)
    }

    pub fn remove_index(&self, project: ProjectId) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(INDEXES)?;
            table.remove(project.0)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INDEXES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }
}

impl std::fmt::Debug for IndexDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDb").finish_non_exhaustive()
    }
}
