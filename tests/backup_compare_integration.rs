//! Integration tests for state backup and RAM/DB comparison.

#[allow(dead_code)]
mod common;

use common::{seeded_snapshot, FaultyStore, TestEnv};
use disk_registry::store::DurableStore;
use disk_registry::types::AgentState;
use disk_registry::{BackupSource, BackupStateRequest, RegistryNode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn backup_request(source: BackupSource) -> BackupStateRequest {
    BackupStateRequest {
        backup_file_path: "/tmp/registry-backup.json".into(),
        source,
    }
}

/// Seed a store with the common fixture and hand back both the store handle
/// and a node built on top of it. The shared handle lets tests mutate the
/// durable state behind the mirror's back.
fn seeded_node(env: &TestEnv) -> (Arc<dyn DurableStore>, Arc<RegistryNode>) {
    let store: Arc<dyn DurableStore> = Arc::new(env.open_store());
    store.write_state(&seeded_snapshot()).unwrap();
    let node = RegistryNode::load(Arc::clone(&store)).unwrap();
    (store, node)
}

#[tokio::test]
async fn test_ram_backup_returns_only_ram_side() {
    let env = TestEnv::new();
    let (_store, node) = seeded_node(&env);

    let response = node.backup_state(backup_request(BackupSource::Ram)).await.unwrap();

    assert_eq!(response.backup_file_path, "/tmp/registry-backup.json");
    let ram = response.ram_backup.expect("ram backup present");
    assert!(response.local_db_backup.is_none());
    assert_eq!(ram.agents.len(), 1);
    // The RAM side reports the node's live mode.
    assert_eq!(ram.config.writable_state, node.is_writable());
}

#[tokio::test]
async fn test_ram_backup_reflects_read_only_mode() {
    let env = TestEnv::new();
    let (_store, node) = seeded_node(&env);
    node.set_writable(false);

    let response = node.backup_state(backup_request(BackupSource::Ram)).await.unwrap();
    assert!(!response.ram_backup.unwrap().config.writable_state);
}

#[tokio::test]
async fn test_db_backup_returns_db_side_and_records_timestamp() {
    let env = TestEnv::new();
    let (_store, node) = seeded_node(&env);

    assert!(node.last_backup_timestamp().unwrap().is_none());

    let response = node
        .backup_state(backup_request(BackupSource::LocalDb))
        .await
        .unwrap();

    assert!(response.ram_backup.is_none());
    let db = response.local_db_backup.expect("local db backup present");
    assert_eq!(db.agents.len(), 1);
    assert_eq!(db.disks.len(), 1);
    assert!(node.last_backup_timestamp().unwrap().is_some());
}

#[tokio::test]
async fn test_both_backup_sides_agree_on_fresh_node() {
    let env = TestEnv::new();
    let (_store, node) = seeded_node(&env);

    let response = node.backup_state(backup_request(BackupSource::Both)).await.unwrap();

    let ram = response.ram_backup.expect("ram backup present");
    let db = response.local_db_backup.expect("local db backup present");
    assert_eq!(disk_registry::diff_backups(&ram, &db), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ram_backup_does_not_wait_for_transaction_queue() {
    let env = TestEnv::new();
    let slow = Arc::new(FaultyStore::with_load_delay(
        env.open_store(),
        Duration::from_millis(500),
    ));
    slow.write_state(&seeded_snapshot()).unwrap();
    let node = RegistryNode::load(Arc::clone(&slow) as Arc<dyn DurableStore>).unwrap();

    // Occupy the transaction queue with a slow durable load.
    let queued = {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            node.backup_state(backup_request(BackupSource::LocalDb)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The RAM fast path must answer while the transaction is in flight.
    let ram_response = tokio::time::timeout(
        Duration::from_millis(100),
        node.backup_state(backup_request(BackupSource::Ram)),
    )
    .await
    .expect("ram backup timed out behind the transaction queue")
    .unwrap();
    assert!(ram_response.ram_backup.is_some());

    let queued_response = queued.await.unwrap().unwrap();
    assert!(queued_response.local_db_backup.is_some());
}

#[tokio::test]
async fn test_backup_aborts_on_load_failure_without_timestamp_write() {
    let env = TestEnv::new();
    let faulty = Arc::new(FaultyStore::new(env.open_store()));
    faulty.write_state(&seeded_snapshot()).unwrap();
    let node = RegistryNode::load(Arc::clone(&faulty) as Arc<dyn DurableStore>).unwrap();

    faulty.fail_loads.store(true, Ordering::SeqCst);
    let result = node.backup_state(backup_request(BackupSource::Both)).await;

    assert!(result.is_err());
    assert!(node.last_backup_timestamp().unwrap().is_none());
}

#[tokio::test]
async fn test_backup_dump_round_trips_through_json() {
    let env = TestEnv::new();
    let (_store, node) = seeded_node(&env);

    let response = node
        .backup_state(backup_request(BackupSource::LocalDb))
        .await
        .unwrap();
    let backup = response.local_db_backup.unwrap();

    let path = env.temp_dir.path().join("backup.json");
    backup.write_json(&path).unwrap();

    let restored: disk_registry::StateBackup =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(restored, backup);
}

#[tokio::test]
async fn test_compare_consistent_state_returns_empty_report() {
    let env = TestEnv::new();
    let (_store, node) = seeded_node(&env);

    let response = Arc::clone(&node).compare_state_with_local_db().await.unwrap();
    assert_eq!(response.source, BackupSource::Both);
    assert_eq!(response.diff_report, "");
}

#[tokio::test]
async fn test_compare_detects_device_assignment_divergence() {
    let env = TestEnv::new();
    let (store, node) = seeded_node(&env);

    // Reassign the dirty device behind the mirror's back: the durable store
    // now says disk-2 while RAM still says disk-1.
    let mut diverged = seeded_snapshot();
    diverged.dirty_devices.insert("dev-1".into(), "disk-2".into());
    store.write_state(&diverged).unwrap();

    let response = Arc::clone(&node).compare_state_with_local_db().await.unwrap();
    assert!(
        response.diff_report.contains("dirty_devices[dev-1].disk_id"),
        "unexpected report: {}",
        response.diff_report
    );
}

#[tokio::test]
async fn test_compare_reports_modified_agent_field() {
    let env = TestEnv::new();
    let (store, node) = seeded_node(&env);

    let mut agent = seeded_snapshot().agents.remove(0);
    agent.node_id = 8;
    store.write_agents(&[agent]).unwrap();

    let response = Arc::clone(&node).compare_state_with_local_db().await.unwrap();
    assert!(
        response.diff_report.contains("agents[a1].node_id"),
        "unexpected report: {}",
        response.diff_report
    );
}

#[tokio::test]
async fn test_compare_ignores_unknown_devices_divergence() {
    let env = TestEnv::new();
    let (store, node) = seeded_node(&env);

    let mut agent = seeded_snapshot().agents.remove(0);
    agent.unknown_devices = vec!["ghost-1".into()];
    store.write_agents(&[agent]).unwrap();

    let response = Arc::clone(&node).compare_state_with_local_db().await.unwrap();
    assert_eq!(response.diff_report, "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminated_compare_worker_still_replies() {
    let env = TestEnv::new();
    let slow = Arc::new(FaultyStore::with_load_delay(
        env.open_store(),
        Duration::from_secs(5),
    ));
    slow.write_state(&seeded_snapshot()).unwrap();
    let node = RegistryNode::load(Arc::clone(&slow) as Arc<dyn DurableStore>).unwrap();

    let compare = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.compare_state_with_local_db().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.workers().live_workers(), 1);

    node.workers().terminate_all();

    let result = tokio::time::timeout(Duration::from_secs(1), compare)
        .await
        .expect("terminated worker left its caller unanswered")
        .unwrap();
    match result {
        Err(disk_registry::RegistryError::Rejected(_)) => {}
        other => panic!("expected rejection, got {:?}", other.is_ok()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_registry_reaps_finished_workers() {
    let env = TestEnv::new();
    let (_store, node) = seeded_node(&env);

    Arc::clone(&node).compare_state_with_local_db().await.unwrap();
    Arc::clone(&node).compare_state_with_local_db().await.unwrap();

    // Replies are delivered before the worker task unwinds; give it a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.workers().live_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backup_serializes_with_inflight_recovery_transaction() {
    let env = TestEnv::new();
    let store: Arc<dyn DurableStore> = Arc::new(env.open_store());
    let mut snapshot = seeded_snapshot();
    snapshot.agents[0].state = AgentState::Warning;
    snapshot.agents[0].state_ts = chrono::Utc::now() - chrono::Duration::hours(1);
    store.write_state(&snapshot).unwrap();
    let node = RegistryNode::load(store).unwrap();

    let recovery = {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            node.restore_agents_from_warning(chrono::Utc::now(), Duration::from_secs(60))
                .await
        })
    };

    let response = node.backup_state(backup_request(BackupSource::Both)).await.unwrap();
    let affected = recovery.await.unwrap().unwrap();
    assert_eq!(affected, vec!["a1".to_string()]);

    // Whatever order the queue picked, the two sides of one backup agree.
    let ram = response.ram_backup.unwrap();
    let db = response.local_db_backup.unwrap();
    assert_eq!(disk_registry::diff_backups(&ram, &db), "");
}
