//! Supervisor that applies lifecycle writes reported by transfer workers.
//!
//! Workers never touch the registry themselves: they send [`WriteOp`]s over a
//! channel and this state machine is the single consumer that applies them.

use tokio::sync::mpsc;

use crate::storage::models::{FileRecord, UpdateError, WriteOp};
use crate::storage::{Database, DatabaseError};

/// Result of applying one write.
#[derive(Debug, PartialEq)]
pub enum Applied {
    Updated(FileRecord),
    /// The record was deleted while its transfer was in flight.
    Discarded,
}

pub struct FileStateMachine {
    db: Database,
}

impl FileStateMachine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn apply(&self, op: &WriteOp) -> Result<Applied, DatabaseError> {
        match self.db.update_file(op.file_id(), &op.to_update())? {
            Some(file) => Ok(Applied::Updated(file)),
            None => Ok(Applied::Discarded),
        }
    }

    /// Apply a write without stranding its file in `processing`. A rejected
    /// `Fail` is retried once; any other rejected write fails the file with
    /// the error instead. Writes against an already terminal file are not
    /// retried.
    pub fn apply_or_fail(&self, op: &WriteOp) -> Result<Applied, DatabaseError> {
        let err = match self.apply(op) {
            Err(e) if !already_settled(&e) => e,
            result => return result,
        };
        tracing::warn!(file_id = %op.file_id(), error = %err, "Write rejected, failing file");

        let fallback = match op {
            WriteOp::Fail { .. } => op.clone(),
            _ => WriteOp::Fail {
                file_id: op.file_id().to_string(),
                reason: format!("Failed to record transfer result: {err}"),
            },
        };
        self.apply(&fallback)
    }

    /// Apply writes until every sender is gone.
    pub async fn run(self, mut ops: mpsc::Receiver<WriteOp>) {
        while let Some(op) = ops.recv().await {
            match self.apply_or_fail(&op) {
                Ok(Applied::Updated(file)) => {
                    tracing::debug!(file_id = %file.file_id, status = %file.status, "Applied write");
                }
                Ok(Applied::Discarded) => {
                    tracing::debug!(file_id = %op.file_id(), "Discarded write for deleted file");
                }
                Err(e) => {
                    tracing::error!(file_id = %op.file_id(), error = %e, "Failed to apply write");
                }
            }
        }
        tracing::debug!("Write supervisor stopped");
    }
}

fn already_settled(e: &DatabaseError) -> bool {
    matches!(
        e,
        DatabaseError::Update(UpdateError::InvalidTransition { from, .. }) if from.is_terminal()
    )
}
