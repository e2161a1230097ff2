use redb::TableDefinition;

/// File records: file_id -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Every file_id ever allocated -> allocation time (unix millis). Never pruned,
/// so ids are not handed out again after a delete.
pub const FILE_IDS: TableDefinition<&str, i64> = TableDefinition::new("file_ids");

/// Index: provider_ref -> file_id, for completed files
pub const FILE_PROVIDER_REFS: TableDefinition<&str, &str> =
    TableDefinition::new("file_provider_refs");
