//! High-level configuration client.
//!
//! [`Config`] owns the backend connection, the process owner record and the
//! keyspace layout. Its transactions ([`ConfigTransaction`]) wrap the core
//! [`Transaction`] with typed operations over the well-known keys:
//! processing blocks, scheduling blocks, sub-arrays, master state,
//! deployments and workflow definitions. All values are JSON objects,
//! serialised with sorted keys and 2-space indent so that successive writes
//! of equal content are byte-identical.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize as _;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Backend, Etcd3Backend, Etcd3Options, Lease, MemoryBackend};
use crate::entity::{Deployment, ProcessingBlock, WorkflowRef};
use crate::error::{CResult, Error};
use crate::txn::{Transaction, DEFAULT_MAX_RETRIES};
use crate::watcher::{Trigger, Wakeup, Watcher};

/// Time-to-live for the lease backing ownership claims, in seconds.
pub const DEFAULT_LEASE_TTL: u64 = 10;

/// Daily bound on generated processing block IDs per generator.
pub const MAX_PB_PER_DAY: u32 = 100_000;

/// Levels searched when tearing down everything below a deployment or
/// workflow key.
const SUBTREE_DELETE_DEPTH: usize = 5;

/// Which backend implementation a [`Config`] talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Etcd3,
    Memory,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> CResult<Self> {
        match s {
            "etcd3" => Ok(BackendKind::Etcd3),
            "memory" => Ok(BackendKind::Memory),
            other => Err(Error::Invalid(format!("unknown configuration backend {other}"))),
        }
    }
}

/// Connection options for [`Config::new`]. [`ConfigOptions::from_env`]
/// reads the `SDP_CONFIG_*` environment variables the deployment scripts
/// set; explicit field assignments take precedence over both.
#[derive(Clone, Debug)]
pub struct ConfigOptions {
    pub backend: BackendKind,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub cert: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Prepended to every key this client reads or writes.
    pub global_prefix: String,
    /// Overrides the captured process identity.
    pub owner: Option<OwnerRecord>,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        ConfigOptions {
            backend: BackendKind::Etcd3,
            host: "127.0.0.1".to_owned(),
            port: 2379,
            protocol: "http".to_owned(),
            cert: None,
            username: None,
            password: None,
            global_prefix: String::new(),
            owner: None,
        }
    }
}

impl ConfigOptions {
    /// Defaults overridden by `SDP_CONFIG_BACKEND`, `SDP_CONFIG_HOST`,
    /// `SDP_CONFIG_PORT`, `SDP_CONFIG_PROTOCOL`, `SDP_CONFIG_CERT`,
    /// `SDP_CONFIG_USERNAME` and `SDP_CONFIG_PASSWORD`.
    pub fn from_env() -> CResult<Self> {
        let mut options = ConfigOptions::default();
        if let Ok(backend) = env::var("SDP_CONFIG_BACKEND") {
            options.backend = backend.parse()?;
        }
        if let Ok(host) = env::var("SDP_CONFIG_HOST") {
            options.host = host;
        }
        if let Ok(port) = env::var("SDP_CONFIG_PORT") {
            options.port = port
                .parse()
                .map_err(|_| Error::Invalid(format!("invalid SDP_CONFIG_PORT {port:?}")))?;
        }
        if let Ok(protocol) = env::var("SDP_CONFIG_PROTOCOL") {
            options.protocol = protocol;
        }
        if let Ok(cert) = env::var("SDP_CONFIG_CERT") {
            options.cert = Some(PathBuf::from(cert));
        }
        options.username = env::var("SDP_CONFIG_USERNAME").ok();
        options.password = env::var("SDP_CONFIG_PASSWORD").ok();
        Ok(options)
    }
}

/// Identifies a client process when claiming ownership of work. Written
/// under a lease, so it disappears when the process goes away.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub pid: u32,
    pub hostname: String,
    pub command: Vec<String>,
}

impl OwnerRecord {
    /// Capture the identity of the current process.
    pub fn capture() -> Self {
        OwnerRecord {
            pid: std::process::id(),
            hostname: hostname(),
            command: env::args().collect(),
        }
    }
}

fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Keyspace layout under the global prefix.
struct Paths {
    pb: String,
    sb: String,
    subarray: String,
    master: String,
    deploy: String,
    workflow: String,
}

impl Paths {
    fn new(global_prefix: &str) -> CResult<Self> {
        if !global_prefix.is_empty() && !global_prefix.starts_with('/') {
            return Err(Error::Invalid(format!(
                "global prefix {global_prefix:?} must start with '/'"
            )));
        }
        Ok(Paths {
            pb: format!("{global_prefix}/pb/"),
            sb: format!("{global_prefix}/sb/"),
            subarray: format!("{global_prefix}/subarray/"),
            master: format!("{global_prefix}/master"),
            deploy: format!("{global_prefix}/deploy/"),
            workflow: format!("{global_prefix}/workflow/"),
        })
    }
}

/// Serialise a JSON value the way it is stored: sorted keys, 2-space
/// indent. Two writes of equal content always produce identical bytes.
pub fn to_stable_json(value: &Value) -> CResult<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    String::from_utf8(buf).map_err(|_| Error::Backend("serialised JSON was not UTF-8".to_owned()))
}

/// Connection to the configuration database.
pub struct Config {
    backend: Arc<dyn Backend>,
    owner: OwnerRecord,
    paths: Paths,
    client_lease: Mutex<Option<Arc<Lease>>>,
}

impl Config {
    /// Connect using the given options.
    pub fn new(options: ConfigOptions) -> CResult<Self> {
        let backend: Arc<dyn Backend> = match options.backend {
            BackendKind::Etcd3 => Arc::new(Etcd3Backend::connect(&Etcd3Options {
                host: options.host.clone(),
                port: options.port,
                protocol: options.protocol.clone(),
                cert: options.cert.clone(),
                username: options.username.clone(),
                password: options.password.clone(),
            })?),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        Self::with_backend(backend, &options)
    }

    /// Wrap an existing backend handle. Lets several clients share one
    /// in-memory store in tests.
    pub fn with_backend(backend: Arc<dyn Backend>, options: &ConfigOptions) -> CResult<Self> {
        Ok(Config {
            backend,
            owner: options.owner.clone().unwrap_or_else(OwnerRecord::capture),
            paths: Paths::new(&options.global_prefix)?,
            client_lease: Mutex::new(None),
        })
    }

    /// The backend database handle, for direct access past the typed API.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The identity this client claims ownership with.
    pub fn owner(&self) -> &OwnerRecord {
        &self.owner
    }

    /// Grant a fresh lease with the given time-to-live in seconds.
    pub fn lease(&self, ttl: u64) -> CResult<Lease> {
        self.backend.lease(ttl)
    }

    /// The lease associated with this client, granted on first use and kept
    /// alive until the client is closed.
    pub fn client_lease(&self) -> CResult<Arc<Lease>> {
        let mut guard = self
            .client_lease
            .lock()
            .map_err(|_| Error::Backend("client lease mutex poisoned".to_owned()))?;
        if let Some(lease) = guard.as_ref() {
            return Ok(lease.clone());
        }
        let lease = Arc::new(self.backend.lease(DEFAULT_LEASE_TTL)?);
        *guard = Some(lease.clone());
        Ok(lease)
    }

    /// Run `body` as an atomic query/update against the configuration,
    /// retrying on conflict. The body may run several times and must not
    /// have side effects beyond the transaction itself; use
    /// [`Transaction::on_commit`] for one-shot effects.
    pub fn txn<T, F>(&self, body: F) -> CResult<T>
    where
        F: FnMut(&mut ConfigTransaction) -> CResult<T>,
    {
        self.txn_with(DEFAULT_MAX_RETRIES, body)
    }

    /// [`Config::txn`] with an explicit retry bound.
    pub fn txn_with<T, F>(&self, max_retries: u32, mut body: F) -> CResult<T>
    where
        F: FnMut(&mut ConfigTransaction) -> CResult<T>,
    {
        Transaction::run(self.backend.clone(), max_retries, |txn| {
            let mut wrapped = ConfigTransaction { txn, cfg: self };
            body(&mut wrapped)
        })
    }

    /// Create a watcher for waiting on configuration changes. Transactions
    /// opened through [`ConfigWatcher::txn`] determine what the next
    /// [`ConfigWatcher::wait`] blocks on.
    pub fn watcher(&self, timeout: Option<Duration>) -> ConfigWatcher<'_> {
        ConfigWatcher { watcher: Watcher::new(self.backend.clone(), timeout), cfg: self }
    }

    /// Release the client lease and the backend connection.
    pub fn close(&self) {
        if let Ok(mut guard) = self.client_lease.lock() {
            *guard = None;
        }
        self.backend.close();
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.close();
    }
}

/// A watcher handing out [`ConfigTransaction`]s.
pub struct ConfigWatcher<'a> {
    watcher: Watcher,
    cfg: &'a Config,
}

impl ConfigWatcher<'_> {
    /// Run a transaction whose reads the next wait blocks on.
    pub fn txn<T, F>(&mut self, mut body: F) -> CResult<T>
    where
        F: FnMut(&mut ConfigTransaction) -> CResult<T>,
    {
        let cfg = self.cfg;
        self.watcher.txn(|txn| {
            let mut wrapped = ConfigTransaction { txn, cfg };
            body(&mut wrapped)
        })
    }

    /// Block until something read by this iteration's transactions changes.
    pub fn wait(&mut self) -> CResult<Wakeup> {
        self.watcher.wait()
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.watcher.set_timeout(timeout);
    }

    /// Handle for waking the watcher from another thread.
    pub fn trigger(&self) -> Trigger {
        self.watcher.trigger()
    }
}

/// High-level configuration queries and updates to execute atomically.
pub struct ConfigTransaction<'a> {
    txn: &'a mut Transaction,
    cfg: &'a Config,
}

impl ConfigTransaction<'_> {
    /// The underlying transaction, for raw path access.
    pub fn raw(&mut self) -> &mut Transaction {
        self.txn
    }

    fn get_json(&mut self, path: &str) -> CResult<Option<Value>> {
        match self.txn.get(path)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn create_json(&mut self, path: &str, value: &Value, lease: Option<&Lease>) -> CResult<()> {
        self.txn.create(path, &to_stable_json(value)?, lease)
    }

    fn update_json(&mut self, path: &str, value: &Value) -> CResult<()> {
        self.txn.update(path, &to_stable_json(value)?)
    }

    /// List keys under `base` with the additional `prefix`, stripped back
    /// to bare IDs.
    fn list_ids(&mut self, base: &str, prefix: &str) -> CResult<Vec<String>> {
        let found = self.txn.list_keys(&format!("{base}{prefix}"), 0)?;
        Ok(found.iter().filter_map(|key| key.strip_prefix(base)).map(str::to_owned).collect())
    }

    // ------------------------------------------------------------------
    // Processing blocks
    // ------------------------------------------------------------------

    /// Processing block IDs with the given prefix, in lexicographical order.
    pub fn list_processing_blocks(&mut self, prefix: &str) -> CResult<Vec<String>> {
        let base = self.cfg.paths.pb.clone();
        self.list_ids(&base, prefix)
    }

    /// Generate a processing block ID that is not in use yet:
    /// `pb-<generator>-<date>-<nnnnn>` with the lowest free counter for
    /// today. Fails with *exhausted* once the daily counter space is full.
    pub fn new_processing_block_id(&mut self, generator: &str) -> CResult<String> {
        let today = chrono::Local::now().format("%Y%m%d");
        let id_prefix = format!("pb-{generator}-{today}");
        let existing: std::collections::HashSet<String> =
            self.list_processing_blocks(&id_prefix)?.into_iter().collect();
        for ix in 0..MAX_PB_PER_DAY {
            let pb_id = format!("{id_prefix}-{ix:05}");
            if !existing.contains(&pb_id) {
                return Ok(pb_id);
            }
        }
        Err(Error::Exhausted { prefix: id_prefix })
    }

    pub fn get_processing_block(&mut self, pb_id: &str) -> CResult<Option<ProcessingBlock>> {
        let path = format!("{}{}", self.cfg.paths.pb, pb_id);
        match self.get_json(&path)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn create_processing_block(&mut self, pb: &ProcessingBlock) -> CResult<()> {
        let path = format!("{}{}", self.cfg.paths.pb, pb.id);
        self.create_json(&path, &serde_json::to_value(pb)?, None)
    }

    pub fn update_processing_block(&mut self, pb: &ProcessingBlock) -> CResult<()> {
        let path = format!("{}{}", self.cfg.paths.pb, pb.id);
        self.update_json(&path, &serde_json::to_value(pb)?)
    }

    /// The identity currently owning the processing block, if claimed.
    pub fn get_processing_block_owner(&mut self, pb_id: &str) -> CResult<Option<OwnerRecord>> {
        let path = format!("{}{}/owner", self.cfg.paths.pb, pb_id);
        match self.get_json(&path)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Whether the processing block exists and is owned by this client.
    pub fn is_processing_block_owner(&mut self, pb_id: &str) -> CResult<bool> {
        let exists = self.get_processing_block(pb_id)?.is_some();
        let owner = self.get_processing_block_owner(pb_id)?;
        Ok(exists && owner.as_ref() == Some(&self.cfg.owner))
    }

    /// Claim ownership of a processing block. The owner key is bound to the
    /// given lease, so the claim lapses when the claiming process goes away.
    pub fn take_processing_block(&mut self, pb_id: &str, lease: &Lease) -> CResult<()> {
        let path = format!("{}{}/owner", self.cfg.paths.pb, pb_id);
        let owner = serde_json::to_value(&self.cfg.owner)?;
        self.create_json(&path, &owner, Some(lease))
    }

    pub fn get_processing_block_state(&mut self, pb_id: &str) -> CResult<Option<Value>> {
        let path = format!("{}{}/state", self.cfg.paths.pb, pb_id);
        self.get_json(&path)
    }

    pub fn create_processing_block_state(&mut self, pb_id: &str, state: &Value) -> CResult<()> {
        let path = format!("{}{}/state", self.cfg.paths.pb, pb_id);
        self.create_json(&path, state, None)
    }

    pub fn update_processing_block_state(&mut self, pb_id: &str, state: &Value) -> CResult<()> {
        let path = format!("{}{}/state", self.cfg.paths.pb, pb_id);
        self.update_json(&path, state)
    }

    // ------------------------------------------------------------------
    // Scheduling blocks
    // ------------------------------------------------------------------

    pub fn list_scheduling_blocks(&mut self, prefix: &str) -> CResult<Vec<String>> {
        let base = self.cfg.paths.sb.clone();
        self.list_ids(&base, prefix)
    }

    pub fn get_scheduling_block(&mut self, sb_id: &str) -> CResult<Option<Value>> {
        let path = format!("{}{}", self.cfg.paths.sb, sb_id);
        self.get_json(&path)
    }

    pub fn create_scheduling_block(&mut self, sb_id: &str, state: &Value) -> CResult<()> {
        let path = format!("{}{}", self.cfg.paths.sb, sb_id);
        self.create_json(&path, state, None)
    }

    pub fn update_scheduling_block(&mut self, sb_id: &str, state: &Value) -> CResult<()> {
        let path = format!("{}{}", self.cfg.paths.sb, sb_id);
        self.update_json(&path, state)
    }

    // ------------------------------------------------------------------
    // Sub-arrays
    // ------------------------------------------------------------------

    pub fn list_subarrays(&mut self, prefix: &str) -> CResult<Vec<String>> {
        let base = self.cfg.paths.subarray.clone();
        self.list_ids(&base, prefix)
    }

    pub fn get_subarray(&mut self, subarray_id: &str) -> CResult<Option<Value>> {
        let path = format!("{}{}", self.cfg.paths.subarray, subarray_id);
        self.get_json(&path)
    }

    pub fn create_subarray(&mut self, subarray_id: &str, state: &Value) -> CResult<()> {
        let path = format!("{}{}", self.cfg.paths.subarray, subarray_id);
        self.create_json(&path, state, None)
    }

    pub fn update_subarray(&mut self, subarray_id: &str, state: &Value) -> CResult<()> {
        let path = format!("{}{}", self.cfg.paths.subarray, subarray_id);
        self.update_json(&path, state)
    }

    // ------------------------------------------------------------------
    // Master
    // ------------------------------------------------------------------

    pub fn get_master(&mut self) -> CResult<Option<Value>> {
        let path = self.cfg.paths.master.clone();
        self.get_json(&path)
    }

    pub fn create_master(&mut self, state: &Value) -> CResult<()> {
        let path = self.cfg.paths.master.clone();
        self.create_json(&path, state, None)
    }

    pub fn update_master(&mut self, state: &Value) -> CResult<()> {
        let path = self.cfg.paths.master.clone();
        self.update_json(&path, state)
    }

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    pub fn list_deployments(&mut self, prefix: &str) -> CResult<Vec<String>> {
        let base = self.cfg.paths.deploy.clone();
        self.list_ids(&base, prefix)
    }

    pub fn get_deployment(&mut self, deploy_id: &str) -> CResult<Option<Deployment>> {
        let path = format!("{}{}", self.cfg.paths.deploy, deploy_id);
        match self.get_json(&path)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn create_deployment(&mut self, dpl: &Deployment) -> CResult<()> {
        let path = format!("{}{}", self.cfg.paths.deploy, dpl.id);
        self.create_json(&path, &serde_json::to_value(dpl)?, None)
    }

    /// Remove a deployment along with everything recorded beneath it.
    pub fn delete_deployment(&mut self, dpl: &Deployment) -> CResult<()> {
        let path = format!("{}{}", self.cfg.paths.deploy, dpl.id);
        for key in self.txn.list_keys(&path, SUBTREE_DELETE_DEPTH)? {
            self.txn.delete(&key, true)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workflow definitions
    // ------------------------------------------------------------------

    fn workflow_path(&self, workflow: &WorkflowRef) -> String {
        format!(
            "{}{}:{}:{}",
            self.cfg.paths.workflow, workflow.kind, workflow.id, workflow.version
        )
    }

    pub fn create_workflow(&mut self, workflow: &WorkflowRef, definition: &Value) -> CResult<()> {
        let path = self.workflow_path(workflow);
        self.create_json(&path, definition, None)
    }

    pub fn get_workflow(&mut self, workflow: &WorkflowRef) -> CResult<Option<Value>> {
        let path = self.workflow_path(workflow);
        self.get_json(&path)
    }

    /// Workflow keys (`type:id:version`), optionally narrowed by type and
    /// id.
    pub fn list_workflows(&mut self, kind: &str, id: &str) -> CResult<Vec<String>> {
        let base = self.cfg.paths.workflow.clone();
        let path = if kind.is_empty() {
            base.clone()
        } else if id.is_empty() {
            format!("{base}{kind}")
        } else {
            format!("{base}{kind}:{id}")
        };
        let found = self.txn.list_keys(&path, 0)?;
        Ok(found.iter().filter_map(|key| key.strip_prefix(base.as_str())).map(str::to_owned).collect())
    }

    pub fn update_workflow(&mut self, workflow: &WorkflowRef, definition: &Value) -> CResult<()> {
        let path = self.workflow_path(workflow);
        self.update_json(&path, definition)
    }

    pub fn delete_workflow(&mut self, workflow: &WorkflowRef) -> CResult<()> {
        let path = self.workflow_path(workflow);
        for key in self.txn.list_keys(&path, SUBTREE_DELETE_DEPTH)? {
            self.txn.delete(&key, true)?;
        }
        Ok(())
    }
}
