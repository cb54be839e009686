//! `sdp-config` is the coordination substrate of an SDP control plane: a
//! transactional, watch-capable, hierarchical configuration database client.
//! A controller publishes intended state (processing blocks, scheduling
//! blocks, deployments, master and sub-array state); worker processes
//! discover that state, claim ownership of work under leases, and react to
//! changes.
//!
//! The store itself only offers single-key compare-and-swap and range
//! watches. On top of that this crate builds optimistic multi-key
//! transactions ([`Transaction`]) that retry on conflict, and change-driven
//! wait loops ([`Watcher`]) that block until a previously read value is
//! invalidated. Two interchangeable backends implement the storage
//! contract: an etcd-backed one for real deployments and an in-process one
//! for tests.
//!
//! ## Getting started
//!
//! ```rust
//! use sdp_config::{BackendKind, CResult, Config, ConfigOptions};
//! use serde_json::json;
//!
//! fn main() -> CResult<()> {
//!     let mut options = ConfigOptions::default();
//!     options.backend = BackendKind::Memory;
//!     let config = Config::new(options)?;
//!
//!     // Atomically initialise or advance the master state.
//!     config.txn(|txn| {
//!         match txn.get_master()? {
//!             None => txn.create_master(&json!({"state": "standby"})),
//!             Some(_) => txn.update_master(&json!({"state": "on"})),
//!         }
//!     })?;
//!
//!     config.txn(|txn| {
//!         assert_eq!(txn.get_master()?, Some(json!({"state": "standby"})));
//!         Ok(())
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod entity;
pub mod error;
pub mod keys;
pub mod txn;
pub mod watcher;

pub use backend::{
    Backend, DbRevision, DeleteOptions, Etcd3Backend, Etcd3Options, Lease, MemoryBackend,
    Predicate, Recurse, StagedOp, Subscription, WatchEvent, WatchQueue, WatchSignal,
    MAX_DELETE_DEPTH,
};
pub use config::{
    to_stable_json, BackendKind, Config, ConfigOptions, ConfigTransaction, ConfigWatcher,
    OwnerRecord, DEFAULT_LEASE_TTL, MAX_PB_PER_DAY,
};
pub use entity::{Deployment, ProcessingBlock, WorkflowRef};
pub use error::{CResult, Error};
pub use txn::{Transaction, DEFAULT_MAX_RETRIES};
pub use watcher::{Trigger, Wakeup, Watcher};
