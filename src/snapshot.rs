//! Point-in-time snapshots of registry state.
//!
//! Two aggregates exist: [`StateSnapshot`] is the internal form, produced by
//! a full durable-store load or assembled from the in-memory mirror, and
//! [`StateBackup`] is the transport layout a backup response carries. The RAM
//! side and the DB side of a backup share the [`StateBackup`] schema, which
//! is what makes them structurally comparable.
//!
//! The transform from snapshot to backup layout:
//! - maps become explicit entry lists;
//! - the two deadline timestamps become integer microsecond counts;
//! - dirty devices additionally emit a legacy flat list of device ids,
//!   which older tooling still consumes;
//! - `disks_to_reallocate` is emitted under its legacy wire name
//!   `disks_to_notify`;
//! - the sequence counter and writable flag are folded into the config.

use crate::error::Result;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Full point-in-time copy of every registry entity collection plus config.
///
/// Ephemeral: built fresh per request, never persisted as a live object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub config: RegistryConfig,
    /// Dirty device -> disk it was last assigned to (empty = unassigned).
    pub dirty_devices: BTreeMap<DeviceId, DiskId>,
    pub agents: Vec<AgentConfig>,
    pub disks: Vec<DiskConfig>,
    pub placement_groups: Vec<PlacementGroupConfig>,
    pub pending_destroy_disks: Vec<PendingDestroyDisk>,
    pub disks_to_reallocate: Vec<DiskId>,
    pub disk_state_changes: Vec<DiskStateChange>,
    pub last_disk_state_seq_no: u64,
    pub writable_state: bool,
    pub disks_to_cleanup: Vec<DiskId>,
    pub error_notifications: Vec<DiskId>,
    pub user_notifications: Vec<UserNotification>,
    pub outdated_volume_configs: Vec<OutdatedVolumeConfig>,
    pub suspended_devices: Vec<SuspendedDevice>,
    pub automatically_replaced_devices: Vec<AutomaticallyReplacedDevice>,
    pub agent_list_params: BTreeMap<AgentId, AgentListParams>,
}

/// A dirty device in backup layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirtyDeviceEntry {
    pub id: DeviceId,
    pub disk_id: DiskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDestroyDiskEntry {
    pub disk_id: DiskId,
    pub destroy_deadline_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomaticallyReplacedDeviceEntry {
    pub device_id: DeviceId,
    pub replacement_ts_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentParam {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentListParamsEntry {
    pub agent_id: AgentId,
    pub params: Vec<AgentParam>,
}

/// Registry state in transport layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateBackup {
    pub config: RegistryConfig,
    /// Legacy flat list of dirty device ids, kept for older consumers.
    pub old_dirty_devices: Vec<DeviceId>,
    pub dirty_devices: Vec<DirtyDeviceEntry>,
    pub agents: Vec<AgentConfig>,
    pub disks: Vec<DiskConfig>,
    pub placement_groups: Vec<PlacementGroupConfig>,
    pub pending_destroy_disks: Vec<PendingDestroyDiskEntry>,
    pub disks_to_notify: Vec<DiskId>,
    pub disk_state_changes: Vec<DiskStateChange>,
    pub disks_to_cleanup: Vec<DiskId>,
    pub error_notifications: Vec<DiskId>,
    pub user_notifications: Vec<UserNotification>,
    pub outdated_volume_configs: Vec<OutdatedVolumeConfig>,
    pub suspended_devices: Vec<SuspendedDevice>,
    pub automatically_replaced_devices: Vec<AutomaticallyReplacedDeviceEntry>,
    pub agent_list_params: Vec<AgentListParamsEntry>,
}

/// Microseconds since the Unix epoch; pre-epoch timestamps clamp to zero.
pub(crate) fn timestamp_micros(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_micros().max(0) as u64
}

impl StateSnapshot {
    /// Reshape into the transport layout.
    pub fn into_backup(self) -> StateBackup {
        // Destructured without `..` so that adding a field to StateSnapshot
        // without extending this transform fails to compile.
        let StateSnapshot {
            mut config,
            dirty_devices,
            agents,
            disks,
            placement_groups,
            pending_destroy_disks,
            disks_to_reallocate,
            disk_state_changes,
            last_disk_state_seq_no,
            writable_state,
            disks_to_cleanup,
            error_notifications,
            user_notifications,
            outdated_volume_configs,
            suspended_devices,
            automatically_replaced_devices,
            agent_list_params,
        } = self;

        let mut old_dirty_devices = Vec::with_capacity(dirty_devices.len());
        let mut dirty_entries = Vec::with_capacity(dirty_devices.len());
        for (id, disk_id) in dirty_devices {
            old_dirty_devices.push(id.clone());
            dirty_entries.push(DirtyDeviceEntry { id, disk_id });
        }

        config.last_disk_state_seq_no = last_disk_state_seq_no;
        config.writable_state = writable_state;

        StateBackup {
            config,
            old_dirty_devices,
            dirty_devices: dirty_entries,
            agents,
            disks,
            placement_groups,
            pending_destroy_disks: pending_destroy_disks
                .into_iter()
                .map(|d| PendingDestroyDiskEntry {
                    disk_id: d.disk_id,
                    destroy_deadline_us: timestamp_micros(d.destroy_deadline),
                })
                .collect(),
            disks_to_notify: disks_to_reallocate,
            disk_state_changes,
            disks_to_cleanup,
            error_notifications,
            user_notifications,
            outdated_volume_configs,
            suspended_devices,
            automatically_replaced_devices: automatically_replaced_devices
                .into_iter()
                .map(|d| AutomaticallyReplacedDeviceEntry {
                    device_id: d.device_id,
                    replacement_ts_us: timestamp_micros(d.replacement_ts),
                })
                .collect(),
            agent_list_params: agent_list_params
                .into_iter()
                .map(|(agent_id, p)| AgentListParamsEntry {
                    agent_id,
                    params: p
                        .params
                        .into_iter()
                        .map(|(key, value)| AgentParam { key, value })
                        .collect(),
                })
                .collect(),
        }
    }
}

impl StateBackup {
    /// Dump the backup as pretty-printed JSON to `path`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
