//! Optimistic multi-key transactions.
//!
//! A [`Transaction`] logs every read it serves and stages every write. The
//! first read pins the transaction to the backend's revision at that moment,
//! and all later reads are served at the pinned revision, overlaid with the
//! transaction's own staged writes. [`Transaction::commit`] turns the read
//! log into one multi-predicate compare-and-swap: point reads assert the
//! observed modification revision (or continued absence), range reads assert
//! that every observed key still exists and that nothing entered the range.
//! If any predicate fails the commit returns a conflict, nothing is applied,
//! and the caller's body is retried against a fresh snapshot.
//!
//! [`Transaction::run`] is the retry driver: it executes a body closure,
//! commits, and repeats on conflict up to a bounded number of attempts. The
//! body must be idempotent; [`Transaction::on_commit`] registers side
//! effects that must run exactly once per successful commit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::backend::{Backend, DbRevision, Lease, Predicate, Recurse, StagedOp};
use crate::error::{CResult, Error};
use crate::keys;

/// Retry bound for [`Transaction::run`] when the caller does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 64;

/// A series of reads and staged writes to be verified and applied atomically.
pub struct Transaction {
    backend: Arc<dyn Backend>,

    /// Revision pinned by the first read.
    pub(crate) revision: Option<DbRevision>,

    /// Point-read log: observed value and revision per path.
    pub(crate) get_queries: HashMap<String, (Option<String>, DbRevision)>,

    /// Range-read log: observed sorted key set per (path, absolute depth).
    pub(crate) list_queries: HashMap<(String, usize), (Vec<String>, DbRevision)>,

    /// Staged writes: value (`None` is a tombstone) and lease binding.
    updates: BTreeMap<String, (Option<String>, Option<i64>)>,

    pub(crate) committed: bool,
    commit_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl Transaction {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Transaction {
            backend,
            revision: None,
            get_queries: HashMap::new(),
            list_queries: HashMap::new(),
            updates: BTreeMap::new(),
            committed: false,
            commit_callbacks: Vec::new(),
        }
    }

    /// Run `body` against a fresh transaction, committing at the end and
    /// retrying the whole body on conflict, at most `max_retries` times
    /// beyond the first attempt.
    pub fn run<T, F>(backend: Arc<dyn Backend>, max_retries: u32, body: F) -> CResult<T>
    where
        F: FnMut(&mut Transaction) -> CResult<T>,
    {
        let mut txn = Transaction::new(backend);
        Self::run_loop(&mut txn, max_retries, body)
    }

    pub(crate) fn run_loop<T, F>(txn: &mut Transaction, max_retries: u32, mut body: F) -> CResult<T>
    where
        F: FnMut(&mut Transaction) -> CResult<T>,
    {
        let mut retries = 0;
        loop {
            let out = body(txn)?;
            if txn.commit()? {
                return Ok(out);
            }
            retries += 1;
            if retries > max_retries {
                return Err(Error::RetryExhausted { retries: max_retries });
            }
            log::debug!("transaction conflict, retrying ({retries}/{max_retries})");
            txn.reset(None);
        }
    }

    fn ensure_uncommitted(&self) -> CResult<()> {
        if self.committed {
            return Err(Error::Committed);
        }
        Ok(())
    }

    fn pinned(&self) -> Option<i64> {
        self.revision.map(|r| r.revision)
    }

    fn pin(&mut self, revision: DbRevision) {
        if self.revision.is_none() {
            self.revision = Some(revision);
        }
    }

    /// Get the value of a key at the pinned revision, or the value this
    /// transaction has staged for it. Reads are logged for commit-time
    /// verification; repeated and staged reads cost no backend round trip.
    pub fn get(&mut self, path: &str) -> CResult<Option<String>> {
        self.ensure_uncommitted()?;
        keys::check_path(path)?;
        if let Some((value, _)) = self.updates.get(path) {
            return Ok(value.clone());
        }
        if let Some((value, _)) = self.get_queries.get(path) {
            return Ok(value.clone());
        }
        let (value, revision) = self.backend.get(path, self.pinned())?;
        self.pin(revision);
        self.get_queries.insert(path.to_owned(), (value.clone(), revision));
        Ok(value)
    }

    /// List keys with the given path prefix, descending `recurse` levels
    /// below it. Staged creates and deletes are folded into the result.
    pub fn list_keys(&mut self, path: &str, recurse: usize) -> CResult<Vec<String>> {
        let levels: Vec<usize> = (0..=recurse).collect();
        self.list_keys_levels(path, &levels)
    }

    /// Like [`Transaction::list_keys`], for an explicit set of levels.
    pub fn list_keys_levels(&mut self, path: &str, levels: &[usize]) -> CResult<Vec<String>> {
        self.ensure_uncommitted()?;
        keys::check_path_prefix(path)?;
        let base_depth = keys::depth_of(path);
        let mut result = BTreeSet::new();

        for &level in levels {
            let depth = base_depth + level;
            let level_prefix = keys::tag_depth(path, Some(depth))?;

            // Uncommitted writes falling into this range.
            let mut added = BTreeSet::new();
            let mut removed = BTreeSet::new();
            for (staged, (value, _)) in &self.updates {
                if keys::tag_depth(staged, None)?.starts_with(&level_prefix) {
                    match value {
                        Some(_) => added.insert(staged.clone()),
                        None => removed.insert(staged.clone()),
                    };
                }
            }

            let query = (path.to_owned(), depth);
            if !self.list_queries.contains_key(&query) {
                let (observed, revision) =
                    self.backend.list_keys(path, &Recurse::Levels(vec![level]), self.pinned())?;
                self.pin(revision);
                self.list_queries.insert(query.clone(), (observed, revision));
            }
            let (observed, _) = &self.list_queries[&query];
            for key in observed {
                if !removed.contains(key) {
                    result.insert(key.clone());
                }
            }
            result.extend(added);
        }
        Ok(result.into_iter().collect())
    }

    /// Stage creation of a key, failing with *collision* if it exists. The
    /// existence check goes through [`Transaction::get`] and is therefore
    /// verified again at commit time.
    pub fn create(&mut self, path: &str, value: &str, lease: Option<&Lease>) -> CResult<()> {
        self.ensure_uncommitted()?;
        if self.get(path)?.is_some() {
            return Err(Error::collision(path));
        }
        self.updates.insert(path.to_owned(), (Some(value.to_owned()), lease.map(Lease::id)));
        Ok(())
    }

    /// Stage an overwrite of an existing key, failing with *vanished* if it
    /// does not exist.
    pub fn update(&mut self, path: &str, value: &str) -> CResult<()> {
        self.ensure_uncommitted()?;
        if self.get(path)?.is_none() {
            return Err(Error::vanished(path));
        }
        self.updates.insert(path.to_owned(), (Some(value.to_owned()), None));
        Ok(())
    }

    /// Stage deletion of a key. Deleting a key this transaction itself
    /// created cancels the staged create instead.
    pub fn delete(&mut self, path: &str, must_exist: bool) -> CResult<()> {
        self.ensure_uncommitted()?;
        keys::check_path(path)?;
        if must_exist && self.get(path)?.is_none() {
            return Err(Error::vanished(path));
        }
        let observed_absent = matches!(self.get_queries.get(path), Some((None, _)));
        let staged_create = matches!(self.updates.get(path), Some((Some(_), _)));
        if observed_absent && staged_create {
            self.updates.remove(path);
        } else {
            self.updates.insert(path.to_owned(), (None, None));
        }
        Ok(())
    }

    /// Register a side effect to run exactly once if this transaction
    /// commits successfully. Callbacks that fail are the caller's problem;
    /// they are never retried.
    pub fn on_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.commit_callbacks.push(Box::new(callback));
    }

    /// Translate the read log into commit predicates. Point reads subsume
    /// the existence checks of range reads that observed the same key, so no
    /// key is asserted twice.
    fn build_predicates(&self) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        for (path, (_, revision)) in &self.get_queries {
            predicates.push(match revision.mod_revision {
                None => Predicate::Absent { path: path.clone() },
                Some(mod_revision) => Predicate::ModRevisionIs { path: path.clone(), mod_revision },
            });
        }
        let mut asserted: HashSet<&String> = self.get_queries.keys().collect();
        let pinned = self.pinned().unwrap_or(0);
        for ((path, depth), (observed, _)) in &self.list_queries {
            for key in observed {
                if asserted.insert(key) {
                    predicates.push(Predicate::Exists { path: key.clone() });
                }
            }
            predicates.push(Predicate::NoCreatedSince {
                path: path.clone(),
                depth: *depth,
                revision: pinned,
            });
        }
        predicates
    }

    /// Atomically verify the read log and apply the staged writes. Returns
    /// whether the commit succeeded; a conflict is not an error, it asks for
    /// a [`Transaction::reset`] and another attempt.
    pub fn commit(&mut self) -> CResult<bool> {
        self.ensure_uncommitted()?;

        // Nothing staged: the read log needs no verification.
        if self.updates.is_empty() {
            self.committed = true;
            for callback in self.commit_callbacks.drain(..) {
                callback();
            }
            return Ok(true);
        }

        let predicates = self.build_predicates();
        let ops: Vec<StagedOp> = self
            .updates
            .iter()
            .map(|(path, (value, lease))| match value {
                Some(value) => {
                    StagedOp::Put { path: path.clone(), value: value.clone(), lease: *lease }
                }
                None => StagedOp::Delete { path: path.clone() },
            })
            .collect();

        self.committed = true;
        let succeeded = self.backend.commit(&predicates, &ops)?;
        if succeeded {
            for callback in self.commit_callbacks.drain(..) {
                callback();
            }
        } else {
            self.commit_callbacks.clear();
        }
        Ok(succeeded)
    }

    /// Clear all state so the same instance can be driven through another
    /// attempt, optionally pinning the next attempt to a given revision.
    pub fn reset(&mut self, revision: Option<DbRevision>) {
        self.revision = revision;
        self.get_queries.clear();
        self.list_queries.clear();
        self.updates.clear();
        self.committed = false;
        self.commit_callbacks.clear();
    }
}
