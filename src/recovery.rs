//! Automatic agent recovery.
//!
//! Agents parked in `Warning` by external monitoring are promoted back to
//! `Online` once they have sat there for the configured grace period. A
//! self-rearming scheduler drives the scan and always schedules the next
//! tick, regardless of what the current one produced. A failed scan is
//! retried on the next tick rather than surfaced; recovery is self-healing
//! by repetition.

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::node::RegistryNode;
use crate::transaction::{Transaction, TxContext};
use crate::types::AgentId;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The `Warning -> Online` recovery transaction.
pub(crate) struct RestoreAgentsTx {
    now: DateTime<Utc>,
    grace_period: Duration,
    affected: Vec<AgentId>,
}

impl RestoreAgentsTx {
    pub fn new(now: DateTime<Utc>, grace_period: Duration) -> Self {
        Self {
            now,
            grace_period,
            affected: Vec::new(),
        }
    }
}

impl Transaction for RestoreAgentsTx {
    type Output = Vec<AgentId>;

    fn prepare(&mut self, _ctx: &TxContext<'_>) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &TxContext<'_>) -> Result<()> {
        // Qualify under a read lock, persist, then swap the mirror under a
        // short write lock; RAM snapshot readers never wait on the store.
        let restored = ctx
            .state
            .read()
            .collect_agents_to_restore(self.now, self.grace_period)?;
        if restored.is_empty() {
            return Ok(());
        }
        ctx.store.write_agents(&restored)?;
        self.affected = ctx.state.write().apply_restored_agents(restored);
        Ok(())
    }

    fn complete(self) -> Vec<AgentId> {
        self.affected
    }
}

/// Self-rearming timer loop promoting agents out of `Warning`.
pub struct AgentRecoveryScheduler {
    node: Arc<RegistryNode>,
    config: RecoveryConfig,
    running: AtomicBool,
    ticks: AtomicU64,
}

impl AgentRecoveryScheduler {
    pub fn new(node: Arc<RegistryNode>, config: RecoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            node,
            config,
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        })
    }

    /// Start the recovery loop.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("agent recovery scheduler already running");
            return;
        }

        info!(
            tick_interval = ?self.config.tick_interval,
            grace_period = ?self.config.grace_period,
            "starting agent recovery scheduler"
        );

        let scheduler = Arc::clone(&self);
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    /// Stop the recovery loop. The current tick, if any, finishes.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("agent recovery scheduler stopped");
    }

    /// Number of ticks fired since startup, including skipped ones.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    async fn run_loop(&self) {
        // The tick comes after the sleep: each pass through the loop is the
        // re-arm for the next one, so rescheduling cannot depend on the
        // tick's outcome.
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.tick_interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);

        if !self.node.is_writable() {
            debug!("node is read-only, skipping agent recovery scan");
            return;
        }

        match self
            .node
            .restore_agents_from_warning(Utc::now(), self.config.grace_period)
            .await
        {
            Ok(affected) if affected.is_empty() => {
                debug!("no agents eligible for recovery");
            }
            Ok(affected) => {
                info!(agents = ?affected, "restored agents to online");
            }
            Err(e) => {
                warn!(error = %e, "agent recovery scan failed, will retry next tick");
            }
        }
    }
}
