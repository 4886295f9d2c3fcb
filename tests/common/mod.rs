//! Common test utilities for integration tests.

use chrono::{DateTime, TimeZone, Utc};
use disk_registry::error::{RegistryError, Result};
use disk_registry::snapshot::StateSnapshot;
use disk_registry::store::{DurableStore, RocksDurableStore};
use disk_registry::types::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Test environment that manages a temporary store directory.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub data_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let data_dir = temp_dir.path().join("store");
        Self { temp_dir, data_dir }
    }

    pub fn open_store(&self) -> RocksDurableStore {
        RocksDurableStore::open(&self.data_dir).expect("Failed to open store")
    }
}

pub fn test_agent(id: &str, state: AgentState, state_ts: DateTime<Utc>) -> AgentConfig {
    AgentConfig {
        agent_id: id.into(),
        node_id: 7,
        state,
        state_ts,
        state_message: String::new(),
        devices: vec![test_device("dev-1", id)],
        unknown_devices: vec![],
        dedicated: false,
    }
}

pub fn test_device(id: &str, agent_id: &str) -> DeviceConfig {
    DeviceConfig {
        id: id.into(),
        device_name: format!("/dev/{}", id),
        agent_id: agent_id.into(),
        block_size: 4096,
        blocks_count: 1 << 20,
        rack: "rack-1".into(),
        io_weight: 1.0,
        state: DeviceState::Online,
    }
}

/// Fixed fixture timestamp; keeps repeated `seeded_snapshot` calls
/// identical so they compare clean.
pub fn fixture_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// A small but fully-populated cluster: one online agent with a device
/// backing one disk, plus a dirty device record for it.
pub fn seeded_snapshot() -> StateSnapshot {
    StateSnapshot {
        config: RegistryConfig {
            version: 1,
            ..Default::default()
        },
        dirty_devices: [("dev-1".to_string(), "disk-1".to_string())]
            .into_iter()
            .collect(),
        agents: vec![test_agent("a1", AgentState::Online, fixture_ts())],
        disks: vec![DiskConfig {
            disk_id: "disk-1".into(),
            device_ids: vec!["dev-1".into()],
            state: DiskState::Online,
            block_size: 4096,
            folder_id: String::new(),
        }],
        last_disk_state_seq_no: 5,
        writable_state: true,
        ..Default::default()
    }
}

/// Store wrapper with switchable faults and a configurable load delay.
pub struct FaultyStore {
    inner: RocksDurableStore,
    pub load_delay: Duration,
    pub fail_loads: AtomicBool,
    pub fail_agent_writes: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: RocksDurableStore) -> Self {
        Self {
            inner,
            load_delay: Duration::ZERO,
            fail_loads: AtomicBool::new(false),
            fail_agent_writes: AtomicBool::new(false),
        }
    }

    pub fn with_load_delay(inner: RocksDurableStore, delay: Duration) -> Self {
        Self {
            load_delay: delay,
            ..Self::new(inner)
        }
    }
}

impl DurableStore for FaultyStore {
    fn load_all(&self) -> Result<StateSnapshot> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(RegistryError::Storage("injected load failure".into()));
        }
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.inner.load_all()
    }

    fn write_state(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.inner.write_state(snapshot)
    }

    fn write_agents(&self, agents: &[AgentConfig]) -> Result<()> {
        if self.fail_agent_writes.load(Ordering::SeqCst) {
            return Err(RegistryError::Storage("injected write failure".into()));
        }
        self.inner.write_agents(agents)
    }

    fn write_backup_timestamp(&self, ts: DateTime<Utc>) -> Result<()> {
        self.inner.write_backup_timestamp(ts)
    }

    fn last_backup_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.inner.last_backup_timestamp()
    }
}
