//! In-process backend, principally for tests and demos.
//!
//! The store keeps the full version history of every key, so reads at a
//! pinned revision and commit-time predicate verification behave like the
//! networked store, and the whole transaction/watcher test suite can run
//! without a server. Watch events are delivered synchronously at mutation
//! time. Leases are inert: no expiry, no refresh — tests that depend on
//! lease expiry must run against the networked backend.
//!
//! Clones share the same store. Access is serialised through a mutex, but no
//! concurrency guarantees are made beyond what a single-threaded test
//! harness needs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CResult, Error};
use crate::keys;

use super::{
    Backend, DbRevision, DeleteOptions, Lease, Predicate, Recurse, StagedOp, Subscription,
    WatchEvent, WatchQueue, WatchSignal,
};

/// One entry in a key's history. `value` is `None` for tombstones.
struct KvVersion {
    mod_revision: i64,
    create_revision: i64,
    value: Option<String>,
}

struct MemSub {
    id: u64,
    tagged: String,
    exact: bool,
    queue: WatchQueue,
}

struct MemStore {
    /// Global logical clock. Starts at 1; every commit bumps it once.
    revision: i64,
    /// Tagged key to version history, ascending by modification revision.
    keys: BTreeMap<String, Vec<KvVersion>>,
    subs: Vec<MemSub>,
    next_lease: i64,
    next_sub: u64,
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore { revision: 1, keys: BTreeMap::new(), subs: Vec::new(), next_lease: 0, next_sub: 0 }
    }
}

impl MemStore {
    /// Latest live version of a key as of `rev`, skipping tombstones.
    fn read_at(&self, tagged: &str, rev: i64) -> Option<&KvVersion> {
        self.keys
            .get(tagged)?
            .iter()
            .rev()
            .find(|v| v.mod_revision <= rev)
            .filter(|v| v.value.is_some())
    }

    /// Live tagged keys with the given prefix as of `rev`, in tagged order.
    fn live_with_prefix(&self, prefix: &str, rev: i64) -> Vec<String> {
        self.keys
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| self.read_at(k, rev).is_some())
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn check(&self, predicate: &Predicate) -> CResult<bool> {
        let rev = self.revision;
        Ok(match predicate {
            Predicate::Absent { path } => self.read_at(&keys::tag_depth(path, None)?, rev).is_none(),
            Predicate::Exists { path } => self.read_at(&keys::tag_depth(path, None)?, rev).is_some(),
            Predicate::ModRevisionIs { path, mod_revision } => self
                .read_at(&keys::tag_depth(path, None)?, rev)
                .map_or(*mod_revision == 0, |v| v.mod_revision == *mod_revision),
            Predicate::NoCreatedSince { path, depth, revision } => {
                let prefix = keys::tag_depth(path, Some(*depth))?;
                self.live_with_prefix(&prefix, rev).iter().all(|k| {
                    self.read_at(k, rev).map_or(true, |v| v.create_revision <= *revision)
                })
            }
        })
    }

    fn put(&mut self, tagged: String, value: &str, rev: i64) {
        let history = self.keys.entry(tagged).or_default();
        let create_revision = match history.last().filter(|v| v.value.is_some()) {
            Some(live) => live.create_revision,
            None => rev,
        };
        history.push(KvVersion { mod_revision: rev, create_revision, value: Some(value.to_owned()) });
    }

    fn tombstone(&mut self, tagged: &str, rev: i64) {
        if let Some(history) = self.keys.get_mut(tagged) {
            history.push(KvVersion { mod_revision: rev, create_revision: 0, value: None });
        }
    }

    fn notify(&self, tagged: &str, value: Option<&str>, rev: i64) {
        let Ok(path) = keys::untag_depth(tagged) else { return };
        for sub in &self.subs {
            let hit = if sub.exact { sub.tagged == tagged } else { tagged.starts_with(&sub.tagged) };
            if hit {
                // A send failure just means the consuming watcher went away.
                let _ = sub.queue.send(WatchSignal::Event(WatchEvent {
                    path: path.clone(),
                    value: value.map(str::to_owned),
                    revision: DbRevision { revision: rev, mod_revision: Some(rev) },
                }));
            }
        }
    }
}

/// In-memory backend implementation. [`MemoryBackend::clone`] shares the
/// underlying store, which stands in for several clients talking to the same
/// database.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<MemStore>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CResult<MutexGuard<'_, MemStore>> {
        self.store.lock().map_err(|_| Error::Backend("memory store mutex poisoned".to_owned()))
    }
}

impl Backend for MemoryBackend {
    fn get(&self, path: &str, revision: Option<i64>) -> CResult<(Option<String>, DbRevision)> {
        keys::check_path(path)?;
        let tagged = keys::tag_depth(path, None)?;
        let store = self.lock()?;
        let at = revision.unwrap_or(store.revision);
        let kv = store.read_at(&tagged, at);
        let result = (
            kv.and_then(|v| v.value.clone()),
            DbRevision { revision: store.revision, mod_revision: kv.map(|v| v.mod_revision) },
        );
        Ok(result)
    }

    fn list_keys(
        &self,
        path: &str,
        recurse: &Recurse,
        revision: Option<i64>,
    ) -> CResult<(Vec<String>, DbRevision)> {
        keys::check_path_prefix(path)?;
        let base_depth = keys::depth_of(path);
        let store = self.lock()?;
        let at = revision.unwrap_or(store.revision);
        let mut result = Vec::new();
        for level in recurse.levels() {
            let prefix = keys::tag_depth(path, Some(base_depth + level))?;
            for tagged in store.live_with_prefix(&prefix, at) {
                result.push(keys::untag_depth(&tagged)?);
            }
        }
        result.sort();
        Ok((result, DbRevision { revision: store.revision, mod_revision: None }))
    }

    fn create(&self, path: &str, value: &str, lease: Option<&Lease>) -> CResult<()> {
        keys::check_path(path)?;
        let op = StagedOp::Put {
            path: path.to_owned(),
            value: value.to_owned(),
            lease: lease.map(Lease::id),
        };
        match self.commit(&[Predicate::Absent { path: path.to_owned() }], &[op])? {
            true => Ok(()),
            false => Err(Error::collision(path)),
        }
    }

    fn update(&self, path: &str, value: &str, must_be_rev: Option<i64>) -> CResult<()> {
        keys::check_path(path)?;
        let mut predicates = vec![Predicate::Exists { path: path.to_owned() }];
        if let Some(mod_revision) = must_be_rev {
            predicates.push(Predicate::ModRevisionIs { path: path.to_owned(), mod_revision });
        }
        let op = StagedOp::Put { path: path.to_owned(), value: value.to_owned(), lease: None };
        match self.commit(&predicates, &[op])? {
            true => Ok(()),
            false => Err(Error::vanished(path)),
        }
    }

    fn delete(&self, path: &str, options: &DeleteOptions) -> CResult<()> {
        if options.prefix {
            keys::check_path_prefix(path)?;
        } else {
            keys::check_path(path)?;
        }
        let tagged = keys::tag_depth(path, None)?;
        let base_depth = keys::depth_of(path);
        let mut store = self.lock()?;
        let current = store.revision;

        if options.must_exist && store.read_at(&tagged, current).is_none() {
            return Err(Error::vanished(path));
        }

        let child_prefix =
            if options.prefix { path.to_owned() } else { format!("{}/", path) };

        if options.recursive {
            // Hard recursion limit: refuse rather than silently under-delete.
            for key in store.keys.keys() {
                if store.read_at(key, current).is_none() {
                    continue;
                }
                let untagged = keys::untag_depth(key)?;
                if untagged.starts_with(&child_prefix)
                    && keys::depth_of(&untagged) > base_depth + options.max_depth
                {
                    return Err(Error::Backend(format!(
                        "cannot delete {path} recursively: subtree exceeds {} levels",
                        options.max_depth
                    )));
                }
            }
        }

        let mut doomed = Vec::new();
        if options.prefix {
            doomed.extend(store.live_with_prefix(&tagged, current));
        } else if store.read_at(&tagged, current).is_some() {
            doomed.push(tagged);
        }
        if options.recursive {
            for level in base_depth + 1..=base_depth + options.max_depth {
                let prefix = keys::tag_depth(&child_prefix, Some(level))?;
                doomed.extend(store.live_with_prefix(&prefix, current));
            }
        }
        doomed.sort();
        doomed.dedup();

        if doomed.is_empty() {
            return Ok(());
        }
        let rev = store.revision + 1;
        store.revision = rev;
        for key in doomed {
            store.tombstone(&key, rev);
            store.notify(&key, None, rev);
        }
        Ok(())
    }

    fn watch(
        &self,
        path: &str,
        prefix: bool,
        revision: Option<i64>,
        depth: Option<usize>,
    ) -> CResult<Box<dyn Subscription>> {
        if !prefix {
            keys::check_path(path)?;
        }
        Ok(Box::new(MemorySubscription {
            store: self.store.clone(),
            tagged: keys::tag_depth(path, depth)?,
            exact: !prefix,
            start_revision: revision,
            id: None,
        }))
    }

    fn lease(&self, _ttl: u64) -> CResult<Lease> {
        let mut store = self.lock()?;
        store.next_lease += 1;
        Ok(Lease::new(store.next_lease, None))
    }

    fn commit(&self, predicates: &[Predicate], ops: &[StagedOp]) -> CResult<bool> {
        let mut store = self.lock()?;
        for predicate in predicates {
            if !store.check(predicate)? {
                log::debug!("commit predicate failed: {predicate:?}");
                return Ok(false);
            }
        }
        if ops.is_empty() {
            return Ok(true);
        }
        let rev = store.revision + 1;
        store.revision = rev;
        for op in ops {
            match op {
                StagedOp::Put { path, value, lease: _ } => {
                    let tagged = keys::tag_depth(path, None)?;
                    store.put(tagged.clone(), value, rev);
                    store.notify(&tagged, Some(value.as_str()), rev);
                }
                StagedOp::Delete { path } => {
                    let tagged = keys::tag_depth(path, None)?;
                    if store.read_at(&tagged, rev).is_some() {
                        store.tombstone(&tagged, rev);
                        store.notify(&tagged, None, rev);
                    }
                }
            }
        }
        Ok(true)
    }

    fn close(&self) {}
}

struct MemorySubscription {
    store: Arc<Mutex<MemStore>>,
    tagged: String,
    exact: bool,
    start_revision: Option<i64>,
    id: Option<u64>,
}

impl Subscription for MemorySubscription {
    fn start(&mut self, queue: WatchQueue) -> CResult<()> {
        let mut store =
            self.store.lock().map_err(|_| Error::Backend("memory store mutex poisoned".to_owned()))?;

        // Replay history the subscriber has not seen yet, oldest first, so a
        // change between the read and the subscription is never lost.
        if let Some(from) = self.start_revision {
            let mut replay = Vec::new();
            for (key, history) in &store.keys {
                let hit = if self.exact { key == &self.tagged } else { key.starts_with(&self.tagged) };
                if !hit {
                    continue;
                }
                for version in history {
                    if version.mod_revision > from {
                        replay.push((version.mod_revision, key.clone(), version.value.clone()));
                    }
                }
            }
            replay.sort_by(|a, b| a.0.cmp(&b.0));
            for (mod_revision, key, value) in replay {
                let _ = queue.send(WatchSignal::Event(WatchEvent {
                    path: keys::untag_depth(&key)?,
                    value,
                    revision: DbRevision { revision: mod_revision, mod_revision: Some(mod_revision) },
                }));
            }
        }

        let id = store.next_sub;
        store.next_sub += 1;
        store.subs.push(MemSub { id, tagged: self.tagged.clone(), exact: self.exact, queue });
        self.id = Some(id);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Ok(mut store) = self.store.lock() {
                store.subs.retain(|s| s.id != id);
            }
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
