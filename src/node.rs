//! The registry node: transaction host and request surface.
//!
//! One `RegistryNode` owns the in-memory mirror, the durable store handle,
//! the single-writer transaction queue and the compare-worker registry.
//! Requests arrive as typed method calls; each produces exactly one terminal
//! response.

use crate::backup::{BackupSource, BackupStateRequest, BackupStateResponse, BackupTx};
use crate::compare::{CompareStateResponse, CompareWorker, WorkerRegistry};
use crate::error::{RegistryError, Result};
use crate::recovery::RestoreAgentsTx;
use crate::state::RegistryState;
use crate::store::DurableStore;
use crate::transaction::TransactionQueue;
use crate::types::AgentId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A single control-plane node owning registry state.
pub struct RegistryNode {
    state: Arc<RwLock<RegistryState>>,
    store: Arc<dyn DurableStore>,
    tx_queue: TransactionQueue,
    /// Current node mode; `false` while the node is read-only.
    writable: AtomicBool,
    workers: Arc<WorkerRegistry>,
}

impl RegistryNode {
    /// Build the node from a full durable-store load. The node starts in the
    /// mode recorded in the store; `set_writable` overrides it.
    pub fn load(store: Arc<dyn DurableStore>) -> Result<Arc<Self>> {
        let snapshot = store.load_all()?;
        let writable = snapshot.writable_state;
        let state = RegistryState::from_snapshot(snapshot);

        info!(
            agents = state.agent_count(),
            writable, "registry state loaded"
        );

        Ok(Arc::new(Self {
            state: Arc::new(RwLock::new(state)),
            store,
            tx_queue: TransactionQueue::new(),
            writable: AtomicBool::new(writable),
            workers: Arc::new(WorkerRegistry::new()),
        }))
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Registry of outstanding compare workers.
    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub(crate) fn worker_registry(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Produce a backup of registry state from the requested source.
    ///
    /// RAM-only requests are answered synchronously from the mirror and
    /// never enter the transaction queue; the reply reflects the latest
    /// committed in-memory state even while a transaction is in flight.
    pub async fn backup_state(&self, request: BackupStateRequest) -> Result<BackupStateResponse> {
        info!(
            source = ?request.source,
            backup_file_path = %request.backup_file_path,
            "received backup state request"
        );

        if request.source == BackupSource::Ram {
            let mut backup = self.state.read().backup_state();
            backup.config.writable_state = self.is_writable();
            return Ok(BackupStateResponse {
                backup_file_path: request.backup_file_path,
                ram_backup: Some(backup),
                local_db_backup: None,
            });
        }

        let tx = BackupTx::new(request.source, request.backup_file_path);
        self.tx_queue
            .run(Arc::clone(&self.store), Arc::clone(&self.state), tx)
            .await
    }

    /// Compare the in-memory mirror with the durable store.
    ///
    /// Spawns an ephemeral worker; its reply is guaranteed even if the
    /// worker is terminated mid-flight, in which case the caller receives
    /// [`RegistryError::Rejected`].
    pub async fn compare_state_with_local_db(self: Arc<Self>) -> Result<CompareStateResponse> {
        info!("received compare state with local db request");

        let reply = CompareWorker::spawn(self);
        match reply.await {
            Ok(response) => response,
            // The obligation guarantees a send; a closed channel means the
            // runtime tore the worker down before it ever ran.
            Err(_) => Err(RegistryError::Rejected(
                "compare worker dropped without reply".into(),
            )),
        }
    }

    /// Restore agents that have outlived the `Warning` grace period,
    /// atomically against store and mirror. Returns affected agent ids.
    pub async fn restore_agents_from_warning(
        &self,
        now: DateTime<Utc>,
        grace_period: Duration,
    ) -> Result<Vec<AgentId>> {
        let tx = RestoreAgentsTx::new(now, grace_period);
        self.tx_queue
            .run(Arc::clone(&self.store), Arc::clone(&self.state), tx)
            .await
    }

    /// Last successful backup time, if any.
    pub fn last_backup_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.store.last_backup_timestamp()
    }
}
