//! Change-driven wait loops over transaction read logs.
//!
//! A [`Watcher`] wraps a sequence of transactions. After the caller's loop
//! body has run its transactions, [`Watcher::wait`] subscribes to everything
//! those transactions read and blocks until one of the read values has been
//! invalidated: a point-read key changed in any way, or a key entered or
//! left a listed range. Value updates of range-listed keys that were not
//! also point-read do not count as changes.
//!
//! Subscriptions are reconciled lazily between iterations: a range
//! subscription subsumes point subscriptions it covers (so a "list keys,
//! then get each" pattern opens one watch, not O(n)), and subscriptions no
//! longer backed by a read are torn down on the next wait. Events from all
//! subscriptions funnel into one queue consumed by the caller's thread.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, DbRevision, Subscription, WatchEvent, WatchSignal};
use crate::error::CResult;
use crate::keys;
use crate::txn::{Transaction, DEFAULT_MAX_RETRIES};

/// Why a [`Watcher::wait`] call returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// Something the watcher's transactions read was changed externally.
    Changed,
    /// The configured timeout elapsed without a relevant change.
    TimedOut,
    /// [`Trigger::trigger`] was called.
    Triggered,
}

/// Thread-safe handle for waking a [`Watcher`] out of its wait.
#[derive(Clone)]
pub struct Trigger {
    queue: Sender<WatchSignal>,
}

impl Trigger {
    /// Wake the watcher as if its timeout had elapsed. Safe to call from any
    /// thread, any number of times.
    pub fn trigger(&self) {
        let _ = self.queue.send(WatchSignal::Trigger);
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum SubKey {
    Get(String),
    List(String, usize),
}

/// Blocks a caller until any value read by its transactions changes.
pub struct Watcher {
    backend: Arc<dyn Backend>,
    timeout: Option<Duration>,
    max_retries: u32,

    /// Earliest revision pinned by the transactions of the current
    /// iteration; advanced as qualifying events arrive and cleared when
    /// [`Watcher::wait`] returns, so every iteration subscribes and filters
    /// from the revision its own reads were actually served at.
    revision: Option<DbRevision>,
    /// Point-read paths from merged read logs.
    get_log: HashSet<String>,
    /// Range reads from merged read logs: observed sorted key set per
    /// (path, absolute depth).
    list_log: HashMap<(String, usize), Vec<String>>,

    subs: HashMap<SubKey, Box<dyn Subscription>>,
    queue: Sender<WatchSignal>,
    events: Receiver<WatchSignal>,
}

impl Watcher {
    pub fn new(backend: Arc<dyn Backend>, timeout: Option<Duration>) -> Self {
        let (queue, events) = mpsc::channel();
        Watcher {
            backend,
            timeout,
            max_retries: DEFAULT_MAX_RETRIES,
            revision: None,
            get_log: HashSet::new(),
            list_log: HashMap::new(),
            subs: HashMap::new(),
            queue,
            events,
        }
    }

    /// Upper bound on each wait; `None` waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// A cloneable handle that wakes this watcher from other threads.
    pub fn trigger(&self) -> Trigger {
        Trigger { queue: self.queue.clone() }
    }

    /// Run a transaction whose reads contribute to what the next
    /// [`Watcher::wait`] blocks on. Otherwise behaves exactly like
    /// [`Transaction::run`]; there are no consistency guarantees *between*
    /// transactions of the same watcher iteration.
    pub fn txn<T, F>(&mut self, body: F) -> CResult<T>
    where
        F: FnMut(&mut Transaction) -> CResult<T>,
    {
        let mut txn = Transaction::new(self.backend.clone());
        let out = Transaction::run_loop(&mut txn, self.max_retries, body)?;

        if txn.committed {
            // Track the earliest snapshot of this iteration so no change
            // since any of its reads can be missed. The mark is cleared on
            // every wait; carrying it across iterations would make new
            // subscriptions replay history older than the read they guard.
            if let Some(revision) = txn.revision {
                if self.revision.map_or(true, |r| revision.revision < r.revision) {
                    self.revision = Some(revision);
                }
            }
            self.get_log.extend(txn.get_queries.keys().cloned());
            for ((path, depth), (observed, _)) in txn.list_queries.drain() {
                self.list_log.insert((path, depth), observed);
            }
        }
        Ok(out)
    }

    /// Bring the subscription set in line with the current read logs.
    fn reconcile(&mut self) -> CResult<()> {
        let start_revision = self.revision.map(|r| r.revision);
        let mut active = HashSet::new();

        // Watch every listed range. Range watches also fire on value
        // updates; those are filtered in the wait loop.
        let mut prefixes = Vec::new();
        for (path, depth) in self.list_log.keys().cloned().collect::<Vec<_>>() {
            prefixes.push(keys::tag_depth(&path, Some(depth))?);
            let key = SubKey::List(path.clone(), depth);
            if !self.subs.contains_key(&key) {
                let mut sub = self.backend.watch(&path, true, start_revision, Some(depth))?;
                sub.start(self.queue.clone())?;
                self.subs.insert(key.clone(), sub);
            }
            active.insert(key);
        }

        // Watch point-read keys, unless a range watch already covers them.
        // This keeps a list-then-get-each pattern down to a single watch.
        for path in self.get_log.iter().cloned().collect::<Vec<_>>() {
            let tagged = keys::tag_depth(&path, None)?;
            if prefixes.iter().any(|prefix| tagged.starts_with(prefix.as_str())) {
                continue;
            }
            let key = SubKey::Get(path.clone());
            if !self.subs.contains_key(&key) {
                let mut sub = self.backend.watch(&path, false, start_revision, None)?;
                sub.start(self.queue.clone())?;
                self.subs.insert(key.clone(), sub);
            }
            active.insert(key);
        }

        // Tear down subscriptions nothing reads any more. Doing this only
        // here keeps watches alive across retries and non-waiting loops.
        let stale: Vec<SubKey> = self.subs.keys().filter(|k| !active.contains(k)).cloned().collect();
        for key in stale {
            if let Some(mut sub) = self.subs.remove(&key) {
                sub.stop();
            }
        }
        Ok(())
    }

    /// Does this event invalidate something we read?
    fn qualifies(&self, event: &WatchEvent) -> bool {
        // Stale or duplicated delivery.
        if let Some(pinned) = self.revision {
            if event.revision.revision <= pinned.revision {
                return false;
            }
        }
        if self.get_log.contains(&event.path) {
            return true;
        }
        let Ok(tagged) = keys::tag_depth(&event.path, None) else {
            return false;
        };
        for ((path, depth), observed) in &self.list_log {
            let Ok(prefix) = keys::tag_depth(path, Some(*depth)) else {
                continue;
            };
            if tagged.starts_with(&prefix) {
                // Only membership changes matter for a range read: a
                // deletion, or a key we did not observe appearing.
                if event.value.is_none() || observed.binary_search(&event.path).is_err() {
                    return true;
                }
            }
        }
        false
    }

    /// Block until a value read by this iteration's transactions changes,
    /// the timeout elapses, or the watcher is triggered. After the first
    /// qualifying event the queue is drained without blocking, so bursts of
    /// updates coalesce into a single wakeup.
    pub fn wait(&mut self) -> CResult<Wakeup> {
        self.reconcile()?;
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut changed = false;

        let wakeup = loop {
            let signal = if changed {
                match self.events.try_recv() {
                    Ok(signal) => signal,
                    Err(_) => break Wakeup::Changed,
                }
            } else {
                let received = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break Wakeup::TimedOut;
                        }
                        self.events.recv_timeout(deadline - now)
                    }
                    None => self.events.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match received {
                    Ok(signal) => signal,
                    Err(_) => break Wakeup::TimedOut,
                }
            };
            match signal {
                WatchSignal::Trigger => {
                    if changed {
                        break Wakeup::Changed;
                    }
                    break Wakeup::Triggered;
                }
                WatchSignal::Event(event) => {
                    if self.qualifies(&event) {
                        self.revision = Some(event.revision);
                        changed = true;
                    }
                }
            }
        };

        // The next iteration contributes fresh read logs and re-pins its
        // own snapshot revision.
        self.get_log.clear();
        self.list_log.clear();
        self.revision = None;
        Ok(wakeup)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        for (_, sub) in self.subs.iter_mut() {
            sub.stop();
        }
    }
}
