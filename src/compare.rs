//! State comparison between the in-memory mirror and the durable store.
//!
//! A compare request spawns an ephemeral [`CompareWorker`] that asks its
//! owning node for a dual-source backup and runs a structural diff between
//! the RAM and local-DB sides. Divergence is a successful outcome: the
//! response carries a human-readable report, empty when the sources agree.
//!
//! Comparison rules:
//! - floating-point fields are compared with bounded relative tolerance;
//! - an agent's `unknown_devices` list is transient by nature and never
//!   contributes to the report;
//! - everything else is exact, including membership and contents of
//!   collection fields.
//!
//! Each per-type diff function destructures one side without `..`, so a new
//! field cannot be added to an entity without deciding how it is compared.

use crate::backup::{BackupSource, BackupStateRequest};
use crate::error::{RegistryError, Result};
use crate::node::RegistryNode;
use crate::snapshot::*;
use crate::types::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Relative tolerance for floating-point comparison, absorbing
/// representation noise between the two state sources.
const FLOAT_COMPARISON_FRACTION: f64 = 1e-6;

pub(crate) fn approx_eq(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= FLOAT_COMPARISON_FRACTION * a.abs().max(b.abs())
}

/// Result of a compare request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareStateResponse {
    /// Always [`BackupSource::Both`]: the comparison consumed a dual-source
    /// backup.
    pub source: BackupSource,
    /// One line per difference, naming the diverging field path. Empty when
    /// the two sources are consistent.
    pub diff_report: String,
}

struct DiffReport {
    lines: Vec<String>,
}

impl DiffReport {
    fn new() -> Self {
        Self { lines: Vec::new() }
    }

    fn value<T: Debug + PartialEq + ?Sized>(&mut self, path: &str, ram: &T, db: &T) {
        if ram != db {
            self.lines
                .push(format!("modified: {}: {:?} -> {:?}", path, ram, db));
        }
    }

    fn float(&mut self, path: &str, ram: f64, db: f64) {
        if !approx_eq(ram, db) {
            self.lines
                .push(format!("modified: {}: {:?} -> {:?}", path, ram, db));
        }
    }

    fn only_in_ram(&mut self, path: &str) {
        self.lines.push(format!("deleted: {}: missing in local db", path));
    }

    fn only_in_db(&mut self, path: &str) {
        self.lines.push(format!("added: {}: missing in ram", path));
    }

    fn render(self) -> String {
        self.lines.join("\n")
    }
}

/// Diff two keyed collections: membership first, then per-item fields.
fn diff_keyed<'a, T, K: Ord + std::fmt::Display>(
    report: &mut DiffReport,
    path: &str,
    ram: &'a [T],
    db: &'a [T],
    key_of: impl Fn(&T) -> K,
    mut diff_item: impl FnMut(&mut DiffReport, &str, &'a T, &'a T),
) {
    let ram_by_key: BTreeMap<K, &'a T> = ram.iter().map(|item| (key_of(item), item)).collect();
    let db_by_key: BTreeMap<K, &'a T> = db.iter().map(|item| (key_of(item), item)).collect();

    for (key, ram_item) in &ram_by_key {
        let item_path = format!("{}[{}]", path, key);
        match db_by_key.get(key) {
            Some(db_item) => diff_item(report, &item_path, *ram_item, *db_item),
            None => report.only_in_ram(&item_path),
        }
    }
    for key in db_by_key.keys() {
        if !ram_by_key.contains_key(key) {
            report.only_in_db(&format!("{}[{}]", path, key));
        }
    }
}

/// Diff two plain id lists by membership.
fn diff_id_list(report: &mut DiffReport, path: &str, ram: &[String], db: &[String]) {
    let ram_set: BTreeSet<&String> = ram.iter().collect();
    let db_set: BTreeSet<&String> = db.iter().collect();

    for id in ram_set.difference(&db_set) {
        report.only_in_ram(&format!("{}[{}]", path, id));
    }
    for id in db_set.difference(&ram_set) {
        report.only_in_db(&format!("{}[{}]", path, id));
    }
}

fn diff_config(report: &mut DiffReport, path: &str, ram: &RegistryConfig, db: &RegistryConfig) {
    let RegistryConfig {
        version,
        known_agents,
        last_disk_state_seq_no,
        writable_state,
    } = ram;

    report.value(&format!("{}.version", path), version, &db.version);
    diff_keyed(
        report,
        &format!("{}.known_agents", path),
        known_agents,
        &db.known_agents,
        |agent| agent.agent_id.clone(),
        // Only the key itself; membership is the whole comparison.
        |_, _, _, _| {},
    );
    report.value(
        &format!("{}.last_disk_state_seq_no", path),
        last_disk_state_seq_no,
        &db.last_disk_state_seq_no,
    );
    report.value(
        &format!("{}.writable_state", path),
        writable_state,
        &db.writable_state,
    );
}

fn diff_device(report: &mut DiffReport, path: &str, ram: &DeviceConfig, db: &DeviceConfig) {
    let DeviceConfig {
        id: _,
        device_name,
        agent_id,
        block_size,
        blocks_count,
        rack,
        io_weight,
        state,
    } = ram;

    report.value(&format!("{}.device_name", path), device_name, &db.device_name);
    report.value(&format!("{}.agent_id", path), agent_id, &db.agent_id);
    report.value(&format!("{}.block_size", path), block_size, &db.block_size);
    report.value(
        &format!("{}.blocks_count", path),
        blocks_count,
        &db.blocks_count,
    );
    report.value(&format!("{}.rack", path), rack, &db.rack);
    report.float(&format!("{}.io_weight", path), *io_weight, db.io_weight);
    report.value(&format!("{}.state", path), state, &db.state);
}

fn diff_agent(report: &mut DiffReport, path: &str, ram: &AgentConfig, db: &AgentConfig) {
    // `unknown_devices` is expected to diverge while an agent enumerates
    // hardware; it is deliberately absent below.
    let AgentConfig {
        agent_id: _,
        node_id,
        state,
        state_ts,
        state_message,
        devices,
        unknown_devices: _,
        dedicated,
    } = ram;

    report.value(&format!("{}.node_id", path), node_id, &db.node_id);
    report.value(&format!("{}.state", path), state, &db.state);
    report.value(&format!("{}.state_ts", path), state_ts, &db.state_ts);
    report.value(
        &format!("{}.state_message", path),
        state_message,
        &db.state_message,
    );
    diff_keyed(
        report,
        &format!("{}.devices", path),
        devices,
        &db.devices,
        |device| device.id.clone(),
        diff_device,
    );
    report.value(&format!("{}.dedicated", path), dedicated, &db.dedicated);
}

fn diff_disk(report: &mut DiffReport, path: &str, ram: &DiskConfig, db: &DiskConfig) {
    let DiskConfig {
        disk_id: _,
        device_ids,
        state,
        block_size,
        folder_id,
    } = ram;

    diff_id_list(
        report,
        &format!("{}.device_ids", path),
        device_ids,
        &db.device_ids,
    );
    report.value(&format!("{}.state", path), state, &db.state);
    report.value(&format!("{}.block_size", path), block_size, &db.block_size);
    report.value(&format!("{}.folder_id", path), folder_id, &db.folder_id);
}

fn diff_state_change(
    report: &mut DiffReport,
    path: &str,
    ram: &DiskStateChange,
    db: &DiskStateChange,
) {
    let DiskStateChange { state, seq_no: _ } = ram;
    let DiskStateRecord {
        disk_id,
        state: disk_state,
        state_message,
    } = state;

    report.value(&format!("{}.state.disk_id", path), disk_id, &db.state.disk_id);
    report.value(&format!("{}.state.state", path), disk_state, &db.state.state);
    report.value(
        &format!("{}.state.state_message", path),
        state_message,
        &db.state.state_message,
    );
}

/// Structural diff between the RAM and local-DB sides of a backup.
/// Returns an empty string when the two sources are consistent.
pub fn diff_backups(ram: &StateBackup, db: &StateBackup) -> String {
    let mut report = DiffReport::new();

    // Destructured without `..` so that a new backup field cannot ship
    // without a comparison rule.
    let StateBackup {
        config,
        old_dirty_devices,
        dirty_devices,
        agents,
        disks,
        placement_groups,
        pending_destroy_disks,
        disks_to_notify,
        disk_state_changes,
        disks_to_cleanup,
        error_notifications,
        user_notifications,
        outdated_volume_configs,
        suspended_devices,
        automatically_replaced_devices,
        agent_list_params,
    } = ram;

    diff_config(&mut report, "config", config, &db.config);

    diff_id_list(
        &mut report,
        "old_dirty_devices",
        old_dirty_devices,
        &db.old_dirty_devices,
    );
    diff_keyed(
        &mut report,
        "dirty_devices",
        dirty_devices,
        &db.dirty_devices,
        |entry| entry.id.clone(),
        |report, path, ram, db| {
            let DirtyDeviceEntry { id: _, disk_id } = ram;
            report.value(&format!("{}.disk_id", path), disk_id, &db.disk_id);
        },
    );

    diff_keyed(
        &mut report,
        "agents",
        agents,
        &db.agents,
        |agent| agent.agent_id.clone(),
        diff_agent,
    );
    diff_keyed(
        &mut report,
        "disks",
        disks,
        &db.disks,
        |disk| disk.disk_id.clone(),
        diff_disk,
    );
    diff_keyed(
        &mut report,
        "placement_groups",
        placement_groups,
        &db.placement_groups,
        |group| group.group_id.clone(),
        |report, path, ram, db| {
            let PlacementGroupConfig {
                group_id: _,
                disk_ids,
                config_version,
            } = ram;
            diff_id_list(report, &format!("{}.disk_ids", path), disk_ids, &db.disk_ids);
            report.value(
                &format!("{}.config_version", path),
                config_version,
                &db.config_version,
            );
        },
    );

    diff_keyed(
        &mut report,
        "pending_destroy_disks",
        pending_destroy_disks,
        &db.pending_destroy_disks,
        |entry| entry.disk_id.clone(),
        |report, path, ram, db| {
            let PendingDestroyDiskEntry {
                disk_id: _,
                destroy_deadline_us,
            } = ram;
            report.value(
                &format!("{}.destroy_deadline_us", path),
                destroy_deadline_us,
                &db.destroy_deadline_us,
            );
        },
    );

    diff_id_list(&mut report, "disks_to_notify", disks_to_notify, &db.disks_to_notify);
    diff_keyed(
        &mut report,
        "disk_state_changes",
        disk_state_changes,
        &db.disk_state_changes,
        |change| change.seq_no,
        diff_state_change,
    );
    diff_id_list(
        &mut report,
        "disks_to_cleanup",
        disks_to_cleanup,
        &db.disks_to_cleanup,
    );
    diff_id_list(
        &mut report,
        "error_notifications",
        error_notifications,
        &db.error_notifications,
    );

    diff_keyed(
        &mut report,
        "user_notifications",
        user_notifications,
        &db.user_notifications,
        |notification| notification.id.clone(),
        |report, path, ram, db| {
            let UserNotification { id: _, disk_id } = ram;
            report.value(&format!("{}.disk_id", path), disk_id, &db.disk_id);
        },
    );
    diff_keyed(
        &mut report,
        "outdated_volume_configs",
        outdated_volume_configs,
        &db.outdated_volume_configs,
        |outdated| outdated.disk_id.clone(),
        |report, path, ram, db| {
            let OutdatedVolumeConfig {
                disk_id: _,
                config_version,
            } = ram;
            report.value(
                &format!("{}.config_version", path),
                config_version,
                &db.config_version,
            );
        },
    );
    diff_keyed(
        &mut report,
        "suspended_devices",
        suspended_devices,
        &db.suspended_devices,
        |suspended| suspended.device_id.clone(),
        |_, _, ram, _| {
            let SuspendedDevice { device_id: _ } = ram;
        },
    );
    diff_keyed(
        &mut report,
        "automatically_replaced_devices",
        automatically_replaced_devices,
        &db.automatically_replaced_devices,
        |replaced| replaced.device_id.clone(),
        |report, path, ram, db| {
            let AutomaticallyReplacedDeviceEntry {
                device_id: _,
                replacement_ts_us,
            } = ram;
            report.value(
                &format!("{}.replacement_ts_us", path),
                replacement_ts_us,
                &db.replacement_ts_us,
            );
        },
    );
    diff_keyed(
        &mut report,
        "agent_list_params",
        agent_list_params,
        &db.agent_list_params,
        |entry| entry.agent_id.clone(),
        |report, path, ram, db| {
            let AgentListParamsEntry {
                agent_id: _,
                params,
            } = ram;
            diff_keyed(
                report,
                &format!("{}.params", path),
                params,
                &db.params,
                |param| param.key.clone(),
                |report, path, ram, db| {
                    let AgentParam { key: _, value } = ram;
                    report.value(&format!("{}.value", path), value, &db.value);
                },
            );
        },
    );

    report.render()
}

type CompareReply = Result<CompareStateResponse>;

/// Single-use reply token. Exactly one reply reaches the caller on every
/// exit path: dropping an undischarged obligation sends a rejection.
struct ReplyObligation {
    tx: Option<oneshot::Sender<CompareReply>>,
}

impl ReplyObligation {
    fn new(tx: oneshot::Sender<CompareReply>) -> Self {
        Self { tx: Some(tx) }
    }

    fn fulfil(mut self, reply: CompareReply) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(reply);
        }
    }

    fn reject(self, reason: &str) {
        self.fulfil(Err(RegistryError::Rejected(reason.into())));
    }
}

impl Drop for ReplyObligation {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(RegistryError::Rejected(
                "compare worker terminated before completion".into(),
            )));
        }
    }
}

/// Ephemeral task serving one compare request.
pub(crate) struct CompareWorker;

impl CompareWorker {
    /// Spawn a worker against `node`, registering it with the node's worker
    /// registry. The returned receiver yields exactly one reply.
    pub(crate) fn spawn(node: Arc<RegistryNode>) -> oneshot::Receiver<CompareReply> {
        let (tx, rx) = oneshot::channel();
        let obligation = ReplyObligation::new(tx);
        let registry = Arc::clone(node.worker_registry());
        let poison = registry.subscribe();
        let worker_id = rand::random::<u64>();

        let handle = tokio::spawn(Self::run(node, obligation, poison));
        registry.register(worker_id, handle);
        rx
    }

    async fn run(
        node: Arc<RegistryNode>,
        obligation: ReplyObligation,
        mut poison: broadcast::Receiver<()>,
    ) {
        let request = BackupStateRequest {
            backup_file_path: String::new(),
            source: BackupSource::Both,
        };

        tokio::select! {
            _ = poison.recv() => {
                debug!("compare worker terminated before backup completed");
                obligation.reject("compare worker terminated before completion");
            }
            result = node.backup_state(request) => match result {
                Err(e) => obligation.fulfil(Err(e)),
                Ok(response) => match (response.ram_backup, response.local_db_backup) {
                    (Some(ram), Some(db)) => {
                        let diff_report = diff_backups(&ram, &db);
                        if diff_report.is_empty() {
                            info!("compare state with local db result: OK");
                        } else {
                            info!(
                                diff = %diff_report,
                                "compare state with local db found divergence"
                            );
                        }
                        obligation.fulfil(Ok(CompareStateResponse {
                            source: BackupSource::Both,
                            diff_report,
                        }));
                    }
                    _ => obligation.fulfil(Err(RegistryError::Internal(
                        "dual-source backup response missing a snapshot".into(),
                    ))),
                },
            },
        }
    }
}

/// Tracks outstanding compare workers so they can be terminated
/// deliberately (e.g. at shutdown) and their lifetime stays bounded.
pub struct WorkerRegistry {
    poison_tx: broadcast::Sender<()>,
    live: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl WorkerRegistry {
    pub(crate) fn new() -> Self {
        let (poison_tx, _) = broadcast::channel(1);
        Self {
            poison_tx,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.poison_tx.subscribe()
    }

    fn register(&self, id: u64, handle: JoinHandle<()>) {
        let mut live = self.live.lock();
        live.retain(|_, handle| !handle.is_finished());
        live.insert(id, handle);
    }

    /// Number of workers still running.
    pub fn live_workers(&self) -> usize {
        let mut live = self.live.lock();
        live.retain(|_, handle| !handle.is_finished());
        live.len()
    }

    /// Ask every outstanding worker to terminate. Each one still delivers a
    /// rejection reply to its caller.
    pub fn terminate_all(&self) {
        // No receivers just means no workers are outstanding.
        let _ = self.poison_tx.send(());
    }

    /// Terminate outstanding workers and wait for them to finish.
    pub async fn shutdown(&self) {
        self.terminate_all();
        let handles: Vec<JoinHandle<()>> = {
            let mut live = self.live.lock();
            live.drain().map(|(_, handle)| handle).collect()
        };
        let _ = futures::future::join_all(handles).await;
    }
}
