//! Three-phase transactions over registry state.
//!
//! Every mutating operation runs as a [`Transaction`] on the node's single
//! [`TransactionQueue`]: at most one executes at a time, which is what makes
//! the in-memory mirror and the durable store move in lockstep. Read-only
//! snapshot requests never enter the queue.

use crate::error::{RegistryError, Result};
use crate::state::RegistryState;
use crate::store::DurableStore;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;

/// State handed to each transaction phase.
pub(crate) struct TxContext<'a> {
    pub store: &'a dyn DurableStore,
    pub state: &'a RwLock<RegistryState>,
}

/// A serialized registry transaction.
///
/// `prepare` loads and validates; `execute` applies durable writes and the
/// matching mirror mutations; `complete` is the post-commit hook, invoked
/// only when both phases succeeded and after the queue slot is released.
/// Side effects that must happen exactly once per successful transaction
/// (assembling the reply, recording timestamps) belong in `complete`.
pub(crate) trait Transaction: Send + 'static {
    type Output: Send;

    fn prepare(&mut self, ctx: &TxContext<'_>) -> Result<()>;

    fn execute(&mut self, ctx: &TxContext<'_>) -> Result<()>;

    fn complete(self) -> Self::Output;
}

/// The node's single-writer transaction queue.
pub(crate) struct TransactionQueue {
    slot: Arc<Mutex<()>>,
}

impl TransactionQueue {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(())),
        }
    }

    /// Run `tx` to completion. An error from `prepare` or `execute` aborts
    /// the transaction; `complete` never runs on the error path.
    ///
    /// The store-facing phases go to the blocking pool, and the queue guard
    /// travels with them: a caller that gives up mid-transaction cannot let
    /// a second writer in while the phases are still running.
    pub async fn run<T: Transaction>(
        &self,
        store: Arc<dyn DurableStore>,
        state: Arc<RwLock<RegistryState>>,
        mut tx: T,
    ) -> Result<T::Output> {
        let guard = Arc::clone(&self.slot).lock_owned().await;

        let tx = tokio::task::spawn_blocking(move || -> Result<T> {
            let ctx = TxContext {
                store: store.as_ref(),
                state: &state,
            };
            tx.prepare(&ctx)?;
            tx.execute(&ctx)?;
            drop(guard);
            Ok(tx)
        })
        .await
        .map_err(|e| RegistryError::Internal(format!("transaction task failed: {}", e)))??;

        Ok(tx.complete())
    }
}
