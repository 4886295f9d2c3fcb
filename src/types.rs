//! Core registry entity types.
//!
//! Identifiers are supplied by external systems (agents report their own ids
//! and device inventories), so they are plain strings rather than generated
//! handles. Every entity is serde-serializable: the same types back the
//! in-memory mirror, the durable store records and the backup wire layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type DeviceId = String;
pub type DiskId = String;
pub type AgentId = String;
pub type PlacementGroupId = String;

/// Health state of an agent process.
///
/// Only the `Warning -> Online` transition is driven by this crate (the
/// recovery scheduler); entry into `Warning` and `Unavailable` is decided by
/// external monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Online,
    Warning,
    Unavailable,
}

/// Health state of a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Warning,
    Error,
}

/// State of a logical disk assembled from devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Online,
    Migration,
    TemporarilyUnavailable,
    Error,
}

/// A single block device owned by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub device_name: String,
    pub agent_id: AgentId,
    pub block_size: u32,
    pub blocks_count: u64,
    pub rack: String,
    /// Relative scheduling weight. Compared approximately between state
    /// sources; representation noise must not count as divergence.
    pub io_weight: f64,
    pub state: DeviceState,
}

/// An agent process and the devices it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub node_id: u32,
    pub state: AgentState,
    /// When the agent entered its current state. Drives the recovery
    /// grace-period check for agents in `Warning`.
    pub state_ts: DateTime<Utc>,
    pub state_message: String,
    pub devices: Vec<DeviceConfig>,
    /// Devices the agent reported that the registry has no record of.
    /// Transient by nature; excluded from state comparison.
    pub unknown_devices: Vec<DeviceId>,
    pub dedicated: bool,
}

/// A logical disk and its device assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub disk_id: DiskId,
    pub device_ids: Vec<DeviceId>,
    pub state: DiskState,
    pub block_size: u32,
    pub folder_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementGroupConfig {
    pub group_id: PlacementGroupId,
    pub disk_ids: Vec<DiskId>,
    pub config_version: u32,
}

/// A disk state value at a point in the state-change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStateRecord {
    pub disk_id: DiskId,
    pub state: DiskState,
    pub state_message: String,
}

/// One entry of the ordered disk state-change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStateChange {
    pub state: DiskStateRecord,
    pub seq_no: u64,
}

/// A disk scheduled for destruction. The deadline is consumed by an external
/// cleanup process and never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDestroyDisk {
    pub disk_id: DiskId,
    pub destroy_deadline: DateTime<Utc>,
}

/// A device replaced without operator involvement. The timestamp is consumed
/// by external processes and never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomaticallyReplacedDevice {
    pub device_id: DeviceId,
    pub replacement_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotification {
    pub id: String,
    pub disk_id: DiskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutdatedVolumeConfig {
    pub disk_id: DiskId,
    pub config_version: u32,
}

/// A device taken out of allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedDevice {
    pub device_id: DeviceId,
}

/// Per-agent parameter overrides, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentListParams {
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownAgent {
    pub agent_id: AgentId,
}

/// Global registry configuration.
///
/// In the durable config record `last_disk_state_seq_no` and
/// `writable_state` are left at their defaults; the snapshot transform folds
/// the authoritative values in when a backup is assembled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub version: u32,
    pub known_agents: Vec<KnownAgent>,
    pub last_disk_state_seq_no: u64,
    pub writable_state: bool,
}

impl AgentConfig {
    /// How long the agent has been in its current state at `now`.
    /// Negative intervals (clock skew) count as zero.
    pub fn time_in_state(&self, now: DateTime<Utc>) -> chrono::Duration {
        let elapsed = now.signed_duration_since(self.state_ts);
        elapsed.max(chrono::Duration::zero())
    }
}
