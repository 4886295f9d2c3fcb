//! Registry state backup.
//!
//! A backup request names its source: the in-memory mirror (`Ram`), the
//! durable store (`LocalDb`), or both. RAM-only requests are a pure read and
//! reply synchronously without entering the transaction queue; the other two
//! run a three-phase transaction that loads a consistent snapshot, records
//! the backup timestamp, and reshapes the result into transport layout.

use crate::error::Result;
use crate::snapshot::{StateBackup, StateSnapshot};
use crate::transaction::{Transaction, TxContext};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Which state source a backup reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupSource {
    Ram,
    LocalDb,
    Both,
}

#[derive(Debug, Clone)]
pub struct BackupStateRequest {
    /// Path the caller intends to dump the backup to; echoed back verbatim.
    pub backup_file_path: String,
    pub source: BackupSource,
}

/// Backup response. `ram_backup` is present iff the source included RAM,
/// `local_db_backup` iff it included the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStateResponse {
    pub backup_file_path: String,
    pub ram_backup: Option<StateBackup>,
    pub local_db_backup: Option<StateBackup>,
}

/// The LocalDb/Both backup transaction.
pub(crate) struct BackupTx {
    source: BackupSource,
    backup_file_path: String,
    ram_backup: Option<StateBackup>,
    db_snapshot: Option<StateSnapshot>,
}

impl BackupTx {
    pub fn new(source: BackupSource, backup_file_path: String) -> Self {
        Self {
            source,
            backup_file_path,
            ram_backup: None,
            db_snapshot: None,
        }
    }
}

impl Transaction for BackupTx {
    type Output = BackupStateResponse;

    fn prepare(&mut self, ctx: &TxContext<'_>) -> Result<()> {
        if self.source == BackupSource::Both {
            // Capture the mirror before the durable load; the read lock is
            // held only for the copy, not for the load.
            self.ram_backup = Some(ctx.state.read().backup_state());
        }

        self.db_snapshot = Some(ctx.store.load_all()?);
        Ok(())
    }

    fn execute(&mut self, ctx: &TxContext<'_>) -> Result<()> {
        ctx.store.write_backup_timestamp(Utc::now())
    }

    fn complete(self) -> BackupStateResponse {
        let snapshot = self
            .db_snapshot
            .expect("backup transaction completed without prepare");

        info!(
            source = ?self.source,
            backup_file_path = %self.backup_file_path,
            "registry state backup complete"
        );

        BackupStateResponse {
            backup_file_path: self.backup_file_path,
            ram_backup: self.ram_backup,
            local_db_backup: Some(snapshot.into_backup()),
        }
    }
}
