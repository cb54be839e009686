//! Backend contract shared by the networked and in-memory stores.
//!
//! The transaction and watcher layers are written purely against the
//! [`Backend`] trait. A backend provides single-key and range reads at a
//! revision, atomic conditional writes, range watches, leases, and one
//! multi-predicate commit primitive that the transaction layer drives.
//! The two implementations must be behaviorally indistinguishable to the
//! layers above for any program that does not depend on concurrency or
//! lease expiry.

pub mod etcd3;
pub mod memory;

use std::any::Any;
use std::fmt;
use std::sync::mpsc::Sender;

use crate::error::CResult;

pub use etcd3::{Etcd3Backend, Etcd3Options};
pub use memory::MemoryBackend;

/// Maximum number of levels a recursive delete descends below the given path.
/// Deeper trees are refused by the memory backend rather than silently
/// under-deleted.
pub const MAX_DELETE_DEPTH: usize = 16;

/// Identifies a point in the history of the database.
///
/// `revision` is the store's logical clock at the moment the query was
/// served; it can be used for reading a consistent snapshot. `mod_revision`
/// is the clock value at which the queried key was last written, and is
/// `None` if the key did not exist. Revisions drive conflict detection and
/// are never surfaced past the transaction layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DbRevision {
    pub revision: i64,
    pub mod_revision: Option<i64>,
}

/// Recursion levels for a range listing, relative to the queried path's own
/// depth: either every level up to a maximum, or an explicit set of levels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recurse {
    Depth(usize),
    Levels(Vec<usize>),
}

impl Recurse {
    pub fn levels(&self) -> Vec<usize> {
        match self {
            Recurse::Depth(max) => (0..=*max).collect(),
            Recurse::Levels(levels) => levels.clone(),
        }
    }
}

impl From<usize> for Recurse {
    fn from(max: usize) -> Self {
        Recurse::Depth(max)
    }
}

/// A single verification clause of a transaction commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// The key must not exist (its version is zero).
    Absent { path: String },
    /// The key must exist with exactly this modification revision.
    ModRevisionIs { path: String, mod_revision: i64 },
    /// The key must exist (any revision).
    Exists { path: String },
    /// No key tagged at `depth` under `path` may have been created after
    /// `revision`. Guards range reads against keys entering the range.
    NoCreatedSince { path: String, depth: usize, revision: i64 },
}

/// A mutation staged by a transaction, applied if all predicates hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StagedOp {
    Put { path: String, value: String, lease: Option<i64> },
    Delete { path: String },
}

/// Options for [`Backend::delete`].
#[derive(Clone, Debug)]
pub struct DeleteOptions {
    /// Fail with *vanished* if the path does not exist.
    pub must_exist: bool,
    /// Also delete keys at lower levels that have the path as a prefix.
    pub recursive: bool,
    /// Delete all keys at the path's own level with the given prefix.
    pub prefix: bool,
    /// Bound on the number of levels a recursive delete descends.
    pub max_depth: usize,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        DeleteOptions { must_exist: true, recursive: false, prefix: false, max_depth: MAX_DELETE_DEPTH }
    }
}

/// A single change delivered by a watch subscription. `value` is `None` for
/// deletions.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub path: String,
    pub value: Option<String>,
    pub revision: DbRevision,
}

/// What travels over a watcher's delivery queue: real events from
/// subscriptions, or a manual wake-up pushed by [`crate::watcher::Trigger`].
#[derive(Clone, Debug)]
pub enum WatchSignal {
    Event(WatchEvent),
    Trigger,
}

/// Sending half of a watcher's delivery queue. Many subscriptions feed one
/// queue; the watcher's thread is the only consumer.
pub type WatchQueue = Sender<WatchSignal>;

/// A single watch subscription. Created inert by [`Backend::watch`];
/// [`Subscription::start`] begins delivery into the given queue, and
/// [`Subscription::stop`] tears the subscription down again.
pub trait Subscription: Send {
    fn start(&mut self, queue: WatchQueue) -> CResult<()>;
    fn stop(&mut self);
}

/// A server-side time-bounded token. Keys created under a lease are removed
/// when it expires or is released. The networked backend refreshes the lease
/// in the background for as long as the handle is held, and releases it when
/// the handle is dropped.
pub struct Lease {
    id: i64,
    _guard: Option<Box<dyn Any + Send>>,
}

impl Lease {
    pub(crate) fn new(id: i64, guard: Option<Box<dyn Any + Send>>) -> Self {
        Lease { id, _guard: guard }
    }

    /// The backend-assigned lease ID.
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}

/// The pluggable store underneath transactions and watchers.
///
/// Paths at this interface are untagged; implementations apply the depth tag
/// before touching storage. All mutation atomicity is delegated to the
/// backend; the layers above hold no locks.
pub trait Backend: Send + Sync {
    /// Get the value of a key, optionally at an earlier revision. Returns the
    /// value (or `None`) together with the revision of the read.
    fn get(&self, path: &str, revision: Option<i64>) -> CResult<(Option<String>, DbRevision)>;

    /// List keys with the given path prefix at the requested recursion
    /// levels. Returns a sorted list of untagged paths plus the revision of
    /// the read. Append `/` to the path to list child paths.
    fn list_keys(
        &self,
        path: &str,
        recurse: &Recurse,
        revision: Option<i64>,
    ) -> CResult<(Vec<String>, DbRevision)>;

    /// Atomic put-if-absent. Fails with *collision* if the key exists. Keys
    /// created under a lease disappear when the lease ends.
    fn create(&self, path: &str, value: &str, lease: Option<&Lease>) -> CResult<()>;

    /// Atomic put-if-present. Fails with *vanished* if the key is missing; if
    /// `must_be_rev` is given, also fails unless the key's modification
    /// revision matches.
    fn update(&self, path: &str, value: &str, must_be_rev: Option<i64>) -> CResult<()>;

    /// Delete a key, a same-level prefix, or a whole subtree.
    fn delete(&self, path: &str, options: &DeleteOptions) -> CResult<()>;

    /// Subscribe to mutations of a key, or of the range tagged at `depth`
    /// with the given prefix, from `revision` onward.
    fn watch(
        &self,
        path: &str,
        prefix: bool,
        revision: Option<i64>,
        depth: Option<usize>,
    ) -> CResult<Box<dyn Subscription>>;

    /// Grant a lease with the given time-to-live in seconds.
    fn lease(&self, ttl: u64) -> CResult<Lease>;

    /// Atomically verify `predicates` against the current store and, if they
    /// all hold, apply `ops` as one unit. Returns whether the verification
    /// succeeded; a `false` return has no effects.
    fn commit(&self, predicates: &[Predicate], ops: &[StagedOp]) -> CResult<bool>;

    /// Release the client connection. Backends with no connection state
    /// treat this as a no-op.
    fn close(&self);
}
