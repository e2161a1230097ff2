use std::collections::BTreeMap;

use chrono::Utc;
use redb::ReadableTable;
use serde::Serialize;

use super::db::{Database, DatabaseError};
use super::models::{FileRecord, FileStatus, FileType, FileUpdate, NewFile};
use super::tables::*;

/// Bound on id collisions tolerated before `create_file` gives up.
pub const MAX_ID_ATTEMPTS: usize = 8;

/// Default page size for listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Aggregate view over the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_files: u64,
    pub by_status: BTreeMap<FileStatus, u64>,
    /// Bytes across completed files only.
    pub total_size: u64,
    pub by_type: BTreeMap<FileType, u64>,
}

impl RegistryStats {
    pub fn count(&self, status: FileStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

fn new_file_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Database {
    // ========================================================================
    // File operations
    // ========================================================================

    /// Register a new pending file under a freshly allocated id.
    pub fn create_file(&self, new: NewFile) -> Result<FileRecord, DatabaseError> {
        self.create_file_with(new, new_file_id)
    }

    /// Like [`Database::create_file`], drawing candidate ids from `next_id`.
    pub fn create_file_with<F>(&self, new: NewFile, mut next_id: F) -> Result<FileRecord, DatabaseError>
    where
        F: FnMut() -> String,
    {
        let now = Utc::now();
        let write_txn = self.begin_write()?;
        let file = {
            let mut ids = write_txn.open_table(FILE_IDS)?;
            let mut allocated = None;
            for _ in 0..MAX_ID_ATTEMPTS {
                let candidate = next_id();
                let taken = ids.get(candidate.as_str())?.is_some();
                if !taken {
                    allocated = Some(candidate);
                    break;
                }
            }
            let file_id = allocated.ok_or(DatabaseError::IdExhausted(MAX_ID_ATTEMPTS))?;
            ids.insert(file_id.as_str(), now.timestamp_millis())?;

            let file = FileRecord::new(file_id, new, now);
            let data = rmp_serde::to_vec_named(&file)?;
            let mut table = write_txn.open_table(FILES)?;
            table.insert(file.file_id.as_str(), data.as_slice())?;
            file
        };
        write_txn.commit()?;
        Ok(file)
    }

    /// Get a file by its id
    pub fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(file_id)? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Get a completed file by the reference its storage provider assigned
    /// (resolves provider_ref -> file_id -> file)
    pub fn get_file_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let refs = read_txn.open_table(FILE_PROVIDER_REFS)?;

        let file_id = match refs.get(provider_ref)? {
            Some(data) => data.value().to_string(),
            None => return Ok(None),
        };

        let files_table = read_txn.open_table(FILES)?;
        match files_table.get(file_id.as_str())? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Merge a partial update into a record. Returns `None` when the record
    /// does not exist; a rejected update leaves the stored record unchanged.
    pub fn update_file(
        &self,
        file_id: &str,
        update: &FileUpdate,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(FILES)?;
            let existing: Option<FileRecord> = match table.get(file_id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(mut file) => {
                    file.apply(update, Utc::now())?;
                    let serialized = rmp_serde::to_vec_named(&file)?;
                    table.insert(file_id, serialized.as_slice())?;

                    if let Some(ref provider_ref) = file.provider_ref {
                        let mut refs = write_txn.open_table(FILE_PROVIDER_REFS)?;
                        refs.insert(provider_ref.as_str(), file_id)?;
                    }
                    Some(file)
                }
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    /// Delete a file record. The id stays allocated.
    pub fn delete_file(&self, file_id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(FILES)?;
            let removed: Option<FileRecord> = match table.remove(file_id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            if let Some(provider_ref) = removed.as_ref().and_then(|f| f.provider_ref.as_deref()) {
                let mut refs = write_txn.open_table(FILE_PROVIDER_REFS)?;
                refs.remove(provider_ref)?;
            }
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Get all files regardless of status
    pub fn get_all_files(&self) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let mut files = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let file: FileRecord = rmp_serde::from_slice(value.value())?;
            files.push(file);
        }

        Ok(files)
    }

    /// List completed files, newest first, optionally filtered by type.
    pub fn list_files(
        &self,
        file_type: Option<FileType>,
        limit: usize,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        let mut files: Vec<FileRecord> = self
            .get_all_files()?
            .into_iter()
            .filter(|f| f.status == FileStatus::Completed)
            .filter(|f| file_type.map_or(true, |ft| f.file_type == ft))
            .collect();

        files.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        files.truncate(limit);
        Ok(files)
    }

    /// Aggregate counts over a single consistent snapshot.
    pub fn stats(&self) -> Result<RegistryStats, DatabaseError> {
        let mut stats = RegistryStats::default();
        for file in self.get_all_files()? {
            stats.total_files += 1;
            *stats.by_status.entry(file.status).or_default() += 1;
            *stats.by_type.entry(file.file_type).or_default() += 1;
            if file.status == FileStatus::Completed {
                stats.total_size += file.size;
            }
        }
        Ok(stats)
    }
}
