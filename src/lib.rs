//! State-consistency core of a storage-cluster metadata registry.
//!
//! A registry node keeps two representations of cluster state: a fast
//! in-memory mirror used for decisions and a durable transactional store
//! used for crash recovery. This crate keeps the two consistent and proves
//! it on demand:
//!
//! - **Backup**: point-in-time snapshots of registry state, taken from the
//!   mirror, the store, or both at once.
//! - **Compare**: a built-in oracle that diffs the two sources structurally
//!   and reports any divergence by field path.
//! - **Recovery**: a self-rearming background loop that promotes agents out
//!   of the transient `Warning` state after a grace period.
//!
//! # Quick Start
//!
//! ```no_run
//! use disk_registry::store::RocksDurableStore;
//! use disk_registry::{BackupSource, BackupStateRequest, RegistryNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> disk_registry::Result<()> {
//!     let store = Arc::new(RocksDurableStore::open("/var/lib/disk-registry")?);
//!     let node = RegistryNode::load(store)?;
//!
//!     let response = node
//!         .backup_state(BackupStateRequest {
//!             backup_file_path: "/tmp/registry-backup.json".into(),
//!             source: BackupSource::Ram,
//!         })
//!         .await?;
//!     println!("{} agents", response.ram_backup.unwrap().agents.len());
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod compare;
pub mod config;
pub mod error;
pub mod node;
pub mod recovery;
pub mod snapshot;
pub mod state;
pub mod store;
mod transaction;
pub mod types;

pub use backup::{BackupSource, BackupStateRequest, BackupStateResponse};
pub use compare::{diff_backups, CompareStateResponse, WorkerRegistry};
pub use config::{RecoveryConfig, RegistryNodeConfig};
pub use error::{RegistryError, Result};
pub use node::RegistryNode;
pub use recovery::AgentRecoveryScheduler;
pub use snapshot::{StateBackup, StateSnapshot};
pub use state::RegistryState;
