//! Durable storage for registry state.
//!
//! [`DurableStore`] is the seam to the transactional key/value engine. The
//! registry only needs a handful of primitives from it: a consistent full
//! load, atomic batched writes, and the last-backup timestamp record.
//! [`RocksDurableStore`] is the production implementation; tests substitute
//! their own to inject faults or latency.

use crate::error::{RegistryError, Result};
use crate::snapshot::StateSnapshot;
use crate::types::*;
use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Storage interface consumed by the registry.
///
/// Write methods commit atomically: either every record in the call is
/// durable or none is.
pub trait DurableStore: Send + Sync {
    /// Load a transactionally-consistent snapshot of the full state.
    fn load_all(&self) -> Result<StateSnapshot>;

    /// Replace the entire stored state with `snapshot`. Used at bootstrap
    /// and by restore tooling.
    fn write_state(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Persist updated agent records.
    fn write_agents(&self, agents: &[AgentConfig]) -> Result<()>;

    /// Record the time of the last successful backup.
    fn write_backup_timestamp(&self, ts: DateTime<Utc>) -> Result<()>;

    fn last_backup_timestamp(&self) -> Result<Option<DateTime<Utc>>>;
}

const CONFIG_KEY: &[u8] = b"meta/config";
const LAST_BACKUP_TS_KEY: &[u8] = b"meta/last_backup_ts";
const LAST_SEQ_NO_KEY: &[u8] = b"meta/last_disk_state_seq_no";
const WRITABLE_STATE_KEY: &[u8] = b"meta/writable_state";

const AGENT_PREFIX: &[u8] = b"agent/";
const DISK_PREFIX: &[u8] = b"disk/";
const PLACEMENT_GROUP_PREFIX: &[u8] = b"pg/";
const DIRTY_DEVICE_PREFIX: &[u8] = b"dirty/";
const PENDING_DESTROY_PREFIX: &[u8] = b"destroy/";
const REALLOCATE_PREFIX: &[u8] = b"notify/";
const STATE_CHANGE_PREFIX: &[u8] = b"state_change/";
const CLEANUP_PREFIX: &[u8] = b"cleanup/";
const ERROR_NOTIF_PREFIX: &[u8] = b"error_notif/";
const USER_NOTIF_PREFIX: &[u8] = b"user_notif/";
const OUTDATED_PREFIX: &[u8] = b"outdated/";
const SUSPENDED_PREFIX: &[u8] = b"suspended/";
const AUTO_REPLACED_PREFIX: &[u8] = b"replaced/";
const AGENT_PARAMS_PREFIX: &[u8] = b"agent_params/";

/// Registry storage backed by RocksDB.
///
/// Records are bincode-encoded under per-entity key prefixes; singleton
/// values live under `meta/` keys. All multi-record writes go through a
/// `WriteBatch` and `load_all` reads through a RocksDB snapshot, which gives
/// the atomic-commit and consistent-load guarantees the registry relies on.
pub struct RocksDurableStore {
    db: DB,
}

impl RocksDurableStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    fn key(prefix: &[u8], id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + id.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// State-change keys embed the zero-padded sequence number so prefix
    /// iteration yields them in order.
    fn state_change_key(seq_no: u64) -> Vec<u8> {
        Self::key(STATE_CHANGE_PREFIX, &format!("{:020}", seq_no))
    }

    /// First key past every key carrying `prefix`.
    fn prefix_end(prefix: &[u8]) -> Vec<u8> {
        let mut end = prefix.to_vec();
        // Prefixes end in '/', so this never wraps.
        *end.last_mut().expect("prefixes are non-empty") += 1;
        end
    }

    fn put<T: Serialize>(batch: &mut WriteBatch, key: &[u8], value: &T) -> Result<()> {
        batch.put(key, bincode::serialize(value)?);
        Ok(())
    }

    fn load_prefix<T: DeserializeOwned>(
        &self,
        snap: &rocksdb::Snapshot<'_>,
        prefix: &[u8],
    ) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for item in snap.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    fn load_singleton<T: DeserializeOwned>(
        &self,
        snap: &rocksdb::Snapshot<'_>,
        key: &[u8],
    ) -> Result<Option<T>> {
        match snap.get(key)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

impl DurableStore for RocksDurableStore {
    fn load_all(&self) -> Result<StateSnapshot> {
        let snap = self.db.snapshot();

        let config: RegistryConfig = self
            .load_singleton(&snap, CONFIG_KEY)?
            .unwrap_or_default();
        let last_disk_state_seq_no: u64 = self
            .load_singleton(&snap, LAST_SEQ_NO_KEY)?
            .unwrap_or_default();
        let writable_state: bool = self
            .load_singleton(&snap, WRITABLE_STATE_KEY)?
            .unwrap_or_default();

        let dirty_pairs: Vec<(DeviceId, DiskId)> =
            self.load_prefix(&snap, DIRTY_DEVICE_PREFIX)?;
        let param_pairs: Vec<(AgentId, AgentListParams)> =
            self.load_prefix(&snap, AGENT_PARAMS_PREFIX)?;

        Ok(StateSnapshot {
            config,
            dirty_devices: dirty_pairs.into_iter().collect(),
            agents: self.load_prefix(&snap, AGENT_PREFIX)?,
            disks: self.load_prefix(&snap, DISK_PREFIX)?,
            placement_groups: self.load_prefix(&snap, PLACEMENT_GROUP_PREFIX)?,
            pending_destroy_disks: self.load_prefix(&snap, PENDING_DESTROY_PREFIX)?,
            disks_to_reallocate: self.load_prefix(&snap, REALLOCATE_PREFIX)?,
            disk_state_changes: self.load_prefix(&snap, STATE_CHANGE_PREFIX)?,
            last_disk_state_seq_no,
            writable_state,
            disks_to_cleanup: self.load_prefix(&snap, CLEANUP_PREFIX)?,
            error_notifications: self.load_prefix(&snap, ERROR_NOTIF_PREFIX)?,
            user_notifications: self.load_prefix(&snap, USER_NOTIF_PREFIX)?,
            outdated_volume_configs: self.load_prefix(&snap, OUTDATED_PREFIX)?,
            suspended_devices: self.load_prefix(&snap, SUSPENDED_PREFIX)?,
            automatically_replaced_devices: self.load_prefix(&snap, AUTO_REPLACED_PREFIX)?,
            agent_list_params: param_pairs.into_iter().collect(),
        })
    }

    fn write_state(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut batch = WriteBatch::default();

        for prefix in [
            AGENT_PREFIX,
            DISK_PREFIX,
            PLACEMENT_GROUP_PREFIX,
            DIRTY_DEVICE_PREFIX,
            PENDING_DESTROY_PREFIX,
            REALLOCATE_PREFIX,
            STATE_CHANGE_PREFIX,
            CLEANUP_PREFIX,
            ERROR_NOTIF_PREFIX,
            USER_NOTIF_PREFIX,
            OUTDATED_PREFIX,
            SUSPENDED_PREFIX,
            AUTO_REPLACED_PREFIX,
            AGENT_PARAMS_PREFIX,
        ] {
            let end = Self::prefix_end(prefix);
            batch.delete_range(prefix, end.as_slice());
        }

        Self::put(&mut batch, CONFIG_KEY, &snapshot.config)?;
        Self::put(
            &mut batch,
            LAST_SEQ_NO_KEY,
            &snapshot.last_disk_state_seq_no,
        )?;
        Self::put(&mut batch, WRITABLE_STATE_KEY, &snapshot.writable_state)?;

        for agent in &snapshot.agents {
            Self::put(&mut batch, &Self::key(AGENT_PREFIX, &agent.agent_id), agent)?;
        }
        for disk in &snapshot.disks {
            Self::put(&mut batch, &Self::key(DISK_PREFIX, &disk.disk_id), disk)?;
        }
        for group in &snapshot.placement_groups {
            Self::put(
                &mut batch,
                &Self::key(PLACEMENT_GROUP_PREFIX, &group.group_id),
                group,
            )?;
        }
        for (device_id, disk_id) in &snapshot.dirty_devices {
            Self::put(
                &mut batch,
                &Self::key(DIRTY_DEVICE_PREFIX, device_id),
                &(device_id.clone(), disk_id.clone()),
            )?;
        }
        for pending in &snapshot.pending_destroy_disks {
            Self::put(
                &mut batch,
                &Self::key(PENDING_DESTROY_PREFIX, &pending.disk_id),
                pending,
            )?;
        }
        for disk_id in &snapshot.disks_to_reallocate {
            Self::put(&mut batch, &Self::key(REALLOCATE_PREFIX, disk_id), disk_id)?;
        }
        for change in &snapshot.disk_state_changes {
            Self::put(&mut batch, &Self::state_change_key(change.seq_no), change)?;
        }
        for disk_id in &snapshot.disks_to_cleanup {
            Self::put(&mut batch, &Self::key(CLEANUP_PREFIX, disk_id), disk_id)?;
        }
        for disk_id in &snapshot.error_notifications {
            Self::put(&mut batch, &Self::key(ERROR_NOTIF_PREFIX, disk_id), disk_id)?;
        }
        for notification in &snapshot.user_notifications {
            Self::put(
                &mut batch,
                &Self::key(USER_NOTIF_PREFIX, &notification.id),
                notification,
            )?;
        }
        for outdated in &snapshot.outdated_volume_configs {
            Self::put(
                &mut batch,
                &Self::key(OUTDATED_PREFIX, &outdated.disk_id),
                outdated,
            )?;
        }
        for suspended in &snapshot.suspended_devices {
            Self::put(
                &mut batch,
                &Self::key(SUSPENDED_PREFIX, &suspended.device_id),
                suspended,
            )?;
        }
        for replaced in &snapshot.automatically_replaced_devices {
            Self::put(
                &mut batch,
                &Self::key(AUTO_REPLACED_PREFIX, &replaced.device_id),
                replaced,
            )?;
        }
        for (agent_id, params) in &snapshot.agent_list_params {
            Self::put(
                &mut batch,
                &Self::key(AGENT_PARAMS_PREFIX, agent_id),
                &(agent_id.clone(), params.clone()),
            )?;
        }

        self.db.write(batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn write_agents(&self, agents: &[AgentConfig]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for agent in agents {
            Self::put(&mut batch, &Self::key(AGENT_PREFIX, &agent.agent_id), agent)?;
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn write_backup_timestamp(&self, ts: DateTime<Utc>) -> Result<()> {
        self.db
            .put(LAST_BACKUP_TS_KEY, bincode::serialize(&ts)?)
            .map_err(RegistryError::from)
    }

    fn last_backup_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        match self.db.get(LAST_BACKUP_TS_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_snapshot() -> StateSnapshot {
        StateSnapshot {
            config: RegistryConfig {
                version: 3,
                ..Default::default()
            },
            dirty_devices: [("dev-1".to_string(), "disk-1".to_string())]
                .into_iter()
                .collect(),
            agents: vec![AgentConfig {
                agent_id: "agent-1".into(),
                node_id: 1,
                state: AgentState::Online,
                state_ts: Utc::now(),
                state_message: String::new(),
                devices: vec![],
                unknown_devices: vec![],
                dedicated: false,
            }],
            disks: vec![DiskConfig {
                disk_id: "disk-1".into(),
                device_ids: vec!["dev-1".into()],
                state: DiskState::Online,
                block_size: 4096,
                folder_id: String::new(),
            }],
            last_disk_state_seq_no: 9,
            writable_state: true,
            disk_state_changes: vec![DiskStateChange {
                state: DiskStateRecord {
                    disk_id: "disk-1".into(),
                    state: DiskState::Error,
                    state_message: "io failure".into(),
                },
                seq_no: 8,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RocksDurableStore::open(dir.path()).unwrap();

        let snapshot = sample_snapshot();
        store.write_state(&snapshot).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_write_state_replaces_previous_records() {
        let dir = TempDir::new().unwrap();
        let store = RocksDurableStore::open(dir.path()).unwrap();

        store.write_state(&sample_snapshot()).unwrap();

        let mut replacement = sample_snapshot();
        replacement.disks.clear();
        replacement.dirty_devices.clear();
        store.write_state(&replacement).unwrap();

        let loaded = store.load_all().unwrap();
        assert!(loaded.disks.is_empty());
        assert!(loaded.dirty_devices.is_empty());
        assert_eq!(loaded.agents.len(), 1);
    }

    #[test]
    fn test_write_agents_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let store = RocksDurableStore::open(dir.path()).unwrap();
        store.write_state(&sample_snapshot()).unwrap();

        let mut agent = sample_snapshot().agents.remove(0);
        agent.state = AgentState::Warning;
        agent.state_message = "heartbeat lost".into();
        store.write_agents(&[agent.clone()]).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.agents.len(), 1);
        assert_eq!(loaded.agents[0].state, AgentState::Warning);
        assert_eq!(loaded.agents[0].state_message, "heartbeat lost");
    }

    #[test]
    fn test_backup_timestamp_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RocksDurableStore::open(dir.path()).unwrap();

        assert!(store.last_backup_timestamp().unwrap().is_none());

        let ts = Utc::now();
        store.write_backup_timestamp(ts).unwrap();
        assert_eq!(store.last_backup_timestamp().unwrap(), Some(ts));
    }

    #[test]
    fn test_empty_store_loads_default_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = RocksDurableStore::open(dir.path()).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, StateSnapshot::default());
    }
}
