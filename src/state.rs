//! In-memory mirror of registry state.
//!
//! Built once at node startup from a full durable-store load, mutated only
//! inside serialized transactions, discarded on restart. Collections are
//! BTreeMaps keyed by entity id so snapshots iterate deterministically and
//! match the store's prefix-ordered load.

use crate::error::{RegistryError, Result};
use crate::snapshot::{StateBackup, StateSnapshot};
use crate::store::DurableStore;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

/// The in-memory mirror of all registry entities.
pub struct RegistryState {
    config: RegistryConfig,
    agents: BTreeMap<AgentId, AgentConfig>,
    disks: BTreeMap<DiskId, DiskConfig>,
    placement_groups: BTreeMap<PlacementGroupId, PlacementGroupConfig>,
    dirty_devices: BTreeMap<DeviceId, DiskId>,
    suspended_devices: BTreeMap<DeviceId, SuspendedDevice>,
    pending_destroy_disks: BTreeMap<DiskId, PendingDestroyDisk>,
    disks_to_reallocate: BTreeSet<DiskId>,
    disks_to_cleanup: BTreeSet<DiskId>,
    disk_state_changes: Vec<DiskStateChange>,
    error_notifications: BTreeSet<DiskId>,
    user_notifications: Vec<UserNotification>,
    outdated_volume_configs: BTreeMap<DiskId, OutdatedVolumeConfig>,
    automatically_replaced_devices: Vec<AutomaticallyReplacedDevice>,
    agent_list_params: BTreeMap<AgentId, AgentListParams>,
    last_disk_state_seq_no: u64,
    writable_state: bool,
}

impl RegistryState {
    /// Build the mirror from a freshly loaded snapshot.
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            config: snapshot.config,
            agents: snapshot
                .agents
                .into_iter()
                .map(|a| (a.agent_id.clone(), a))
                .collect(),
            disks: snapshot
                .disks
                .into_iter()
                .map(|d| (d.disk_id.clone(), d))
                .collect(),
            placement_groups: snapshot
                .placement_groups
                .into_iter()
                .map(|g| (g.group_id.clone(), g))
                .collect(),
            dirty_devices: snapshot.dirty_devices,
            suspended_devices: snapshot
                .suspended_devices
                .into_iter()
                .map(|s| (s.device_id.clone(), s))
                .collect(),
            pending_destroy_disks: snapshot
                .pending_destroy_disks
                .into_iter()
                .map(|p| (p.disk_id.clone(), p))
                .collect(),
            disks_to_reallocate: snapshot.disks_to_reallocate.into_iter().collect(),
            disks_to_cleanup: snapshot.disks_to_cleanup.into_iter().collect(),
            disk_state_changes: snapshot.disk_state_changes,
            error_notifications: snapshot.error_notifications.into_iter().collect(),
            user_notifications: snapshot.user_notifications,
            outdated_volume_configs: snapshot
                .outdated_volume_configs
                .into_iter()
                .map(|o| (o.disk_id.clone(), o))
                .collect(),
            automatically_replaced_devices: snapshot.automatically_replaced_devices,
            agent_list_params: snapshot.agent_list_params,
            last_disk_state_seq_no: snapshot.last_disk_state_seq_no,
            writable_state: snapshot.writable_state,
        }
    }

    /// Copy the mirror into a snapshot aggregate.
    pub fn to_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            config: self.config.clone(),
            dirty_devices: self.dirty_devices.clone(),
            agents: self.agents.values().cloned().collect(),
            disks: self.disks.values().cloned().collect(),
            placement_groups: self.placement_groups.values().cloned().collect(),
            pending_destroy_disks: self.pending_destroy_disks.values().cloned().collect(),
            disks_to_reallocate: self.disks_to_reallocate.iter().cloned().collect(),
            disk_state_changes: self.disk_state_changes.clone(),
            last_disk_state_seq_no: self.last_disk_state_seq_no,
            writable_state: self.writable_state,
            disks_to_cleanup: self.disks_to_cleanup.iter().cloned().collect(),
            error_notifications: self.error_notifications.iter().cloned().collect(),
            user_notifications: self.user_notifications.clone(),
            outdated_volume_configs: self.outdated_volume_configs.values().cloned().collect(),
            suspended_devices: self.suspended_devices.values().cloned().collect(),
            automatically_replaced_devices: self.automatically_replaced_devices.clone(),
            agent_list_params: self.agent_list_params.clone(),
        }
    }

    /// The RAM snapshot in transport layout.
    pub fn backup_state(&self) -> StateBackup {
        self.to_snapshot().into_backup()
    }

    pub fn writable_state(&self) -> bool {
        self.writable_state
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.get(agent_id)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn last_disk_state_seq_no(&self) -> u64 {
        self.last_disk_state_seq_no
    }

    /// Record an agent state transition decided by external monitoring.
    pub fn set_agent_state(
        &mut self,
        agent_id: &str,
        state: AgentState,
        now: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Result<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(format!("Agent not found: {}", agent_id)))?;

        agent.state = state;
        agent.state_ts = now;
        agent.state_message = message.into();
        debug!(agent_id, ?state, "agent state changed");
        Ok(())
    }

    /// Append a disk state change, allocating the next sequence number.
    /// The counter never moves backwards.
    pub fn apply_disk_state_change(&mut self, record: DiskStateRecord) -> u64 {
        let seq_no = self.last_disk_state_seq_no;
        self.last_disk_state_seq_no += 1;
        self.disk_state_changes.push(DiskStateChange {
            state: record,
            seq_no,
        });
        seq_no
    }

    /// Mark a device dirty, remembering the disk it was assigned to
    /// (empty disk id = unassigned).
    pub fn mark_dirty_device(&mut self, device_id: DeviceId, disk_id: DiskId) {
        self.dirty_devices.insert(device_id, disk_id);
    }

    /// Agents in `Warning` whose grace period has expired at `now`,
    /// as the records they would become once restored.
    pub(crate) fn collect_agents_to_restore(
        &self,
        now: DateTime<Utc>,
        grace_period: Duration,
    ) -> Result<Vec<AgentConfig>> {
        let grace = chrono::Duration::from_std(grace_period).map_err(|e| {
            RegistryError::InvalidArgument(format!("grace period out of range: {}", e))
        })?;

        let mut restored = Vec::new();
        for agent in self.agents.values() {
            if agent.state != AgentState::Warning {
                continue;
            }
            if agent.time_in_state(now) < grace {
                continue;
            }
            let mut updated = agent.clone();
            updated.state = AgentState::Online;
            updated.state_ts = now;
            updated.state_message = "restored to online after warning grace period".into();
            restored.push(updated);
        }
        Ok(restored)
    }

    /// Apply restored agent records to the mirror. The records must already
    /// be durable.
    pub(crate) fn apply_restored_agents(&mut self, restored: Vec<AgentConfig>) -> Vec<AgentId> {
        let mut affected = Vec::with_capacity(restored.len());
        for agent in restored {
            info!(agent_id = %agent.agent_id, "agent restored from warning to online");
            affected.push(agent.agent_id.clone());
            self.agents.insert(agent.agent_id.clone(), agent);
        }
        affected
    }

    /// Restore every agent that has sat in `Warning` for at least
    /// `grace_period`, persisting the transition through `store` before
    /// touching the mirror. A store failure leaves the mirror unchanged.
    ///
    /// Returns the ids of affected agents.
    pub fn restore_agents_from_warning(
        &mut self,
        store: &dyn DurableStore,
        now: DateTime<Utc>,
        grace_period: Duration,
    ) -> Result<Vec<AgentId>> {
        let restored = self.collect_agents_to_restore(now, grace_period)?;
        if restored.is_empty() {
            return Ok(Vec::new());
        }
        store.write_agents(&restored)?;
        Ok(self.apply_restored_agents(restored))
    }
}
