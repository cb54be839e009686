//! Transaction and watcher behavior, driven end-to-end against the
//! in-memory backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use sdp_config::{
    Backend, CResult, DeleteOptions, Error, MemoryBackend, Transaction, Wakeup, Watcher,
};

fn backend() -> (MemoryBackend, Arc<dyn Backend>) {
    let memory = MemoryBackend::new();
    let shared: Arc<dyn Backend> = Arc::new(memory.clone());
    (memory, shared)
}

fn value(db: &MemoryBackend, path: &str) -> CResult<Option<String>> {
    Ok(db.get(path, None)?.0)
}

#[test]
fn create_get_update_delete() -> CResult<()> {
    let (db, shared) = backend();
    db.delete("/t", &DeleteOptions { must_exist: false, recursive: true, ..Default::default() })?;

    Transaction::run(shared.clone(), 64, |txn| {
        assert_eq!(txn.get("/t/k")?, None);
        txn.create("/t/k", "a", None)?;
        assert_eq!(txn.get("/t/k")?, Some("a".to_owned()));
        Ok(())
    })?;
    Transaction::run(shared.clone(), 64, |txn| {
        assert_eq!(txn.get("/t/k")?, Some("a".to_owned()));
        txn.update("/t/k", "b")?;
        assert_eq!(txn.get("/t/k")?, Some("b".to_owned()));
        Ok(())
    })?;
    Transaction::run(shared.clone(), 64, |txn| {
        txn.delete("/t/k", true)?;
        assert_eq!(txn.get("/t/k")?, None);
        Ok(())
    })?;
    Transaction::run(shared, 64, |txn| {
        assert_eq!(txn.get("/t/k")?, None);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn listing() -> CResult<()> {
    let (_, shared) = backend();
    Transaction::run(shared.clone(), 64, |txn| {
        txn.create("/t/a", "1", None)?;
        txn.create("/t/b", "2", None)?;
        // Staged creates are already visible to the listing.
        assert_eq!(txn.list_keys("/t/", 0)?, vec!["/t/a", "/t/b"]);
        Ok(())
    })?;
    Transaction::run(shared, 64, |txn| {
        assert_eq!(txn.list_keys("/t/", 0)?, vec!["/t/a", "/t/b"]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn create_collision() -> CResult<()> {
    let (_, shared) = backend();
    Transaction::run(shared.clone(), 64, |txn| txn.create("/t/x", "1", None))?;
    let result = Transaction::run(shared, 64, |txn| txn.create("/t/x", "2", None));
    assert!(matches!(result, Err(Error::Collision { .. })));
    Ok(())
}

#[test]
fn update_vanished() -> CResult<()> {
    let (_, shared) = backend();
    let result = Transaction::run(shared.clone(), 64, |txn| txn.update("/t/missing", "v"));
    assert!(matches!(result, Err(Error::Vanished { .. })));
    let result = Transaction::run(shared, 64, |txn| txn.delete("/t/missing", true));
    assert!(matches!(result, Err(Error::Vanished { .. })));
    Ok(())
}

#[test]
fn depth_scoping() -> CResult<()> {
    let (_, shared) = backend();
    Transaction::run(shared.clone(), 64, |txn| {
        txn.create("/t/a", "1", None)?;
        txn.create("/t/a/b", "2", None)?;
        txn.create("/t/a/b/c", "3", None)?;
        Ok(())
    })?;
    Transaction::run(shared, 64, |txn| {
        assert_eq!(txn.list_keys("/t/", 0)?, vec!["/t/a"]);
        assert_eq!(txn.list_keys("/t/", 1)?, vec!["/t/a", "/t/a/b"]);
        assert_eq!(txn.list_keys("/t/", 2)?, vec!["/t/a", "/t/a/b", "/t/a/b/c"]);
        assert_eq!(txn.list_keys_levels("/t/", &[1])?, vec!["/t/a/b"]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn reads_come_from_one_snapshot() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k1", "a", None)?;
    db.create("/t/k2", "a", None)?;

    let mut attempt = 0;
    Transaction::run(shared, 64, |txn| {
        attempt += 1;
        assert_eq!(txn.get("/t/k1")?, Some("a".to_owned()));
        if attempt == 1 {
            // Interfere between the two reads; the second read must still
            // come from the pinned snapshot.
            db.update("/t/k2", "b", None)?;
        }
        let expected = if attempt == 1 { "a" } else { "b" };
        assert_eq!(txn.get("/t/k2")?.as_deref(), Some(expected), "attempt {attempt}");
        txn.update("/t/k1", "done")?;
        Ok(())
    })?;
    // The stale read forced exactly one conflict.
    assert_eq!(attempt, 2);
    Ok(())
}

#[test]
fn read_your_writes() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k", "a", None)?;
    Transaction::run(shared, 64, |txn| {
        txn.update("/t/k", "b")?;
        assert_eq!(txn.get("/t/k")?, Some("b".to_owned()));
        txn.create("/t/new", "c", None)?;
        assert_eq!(txn.get("/t/new")?, Some("c".to_owned()));
        txn.delete("/t/k", true)?;
        assert_eq!(txn.get("/t/k")?, None);
        Ok(())
    })?;
    assert_eq!(value(&db, "/t/k")?, None);
    assert_eq!(value(&db, "/t/new")?, Some("c".to_owned()));
    Ok(())
}

#[test]
fn concurrent_writers_conflict_and_retry() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k", "a", None)?;

    let mut observed = Vec::new();
    let mut interfered = false;
    Transaction::run(shared.clone(), 64, |txn| {
        observed.push(txn.get("/t/k")?.expect("key exists"));
        if !interfered {
            interfered = true;
            // A competing transaction reads and writes the same key between
            // our read and our commit. Exactly one of the two commits
            // cleanly; we lose and retry.
            Transaction::run(shared.clone(), 64, |other| {
                other.get("/t/k")?;
                other.update("/t/k", "winner")
            })?;
        }
        txn.update("/t/k", "mine")?;
        Ok(())
    })?;

    assert_eq!(observed, vec!["a".to_owned(), "winner".to_owned()]);
    assert_eq!(value(&db, "/t/k")?, Some("mine".to_owned()));
    Ok(())
}

#[test]
fn range_reads_conflict_on_gained_key() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/a", "1", None)?;

    let mut attempt = 0;
    let mut listings = Vec::new();
    Transaction::run(shared, 64, |txn| {
        attempt += 1;
        listings.push(txn.list_keys("/t/", 0)?);
        if attempt == 1 {
            db.create("/t/b", "2", None)?;
        }
        txn.update("/t/a", "touched")?;
        Ok(())
    })?;

    assert_eq!(attempt, 2);
    assert_eq!(listings, vec![vec!["/t/a".to_owned()], vec!["/t/a".to_owned(), "/t/b".to_owned()]]);
    Ok(())
}

#[test]
fn range_reads_conflict_on_lost_key() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/a", "1", None)?;
    db.create("/t/b", "2", None)?;

    let mut attempt = 0;
    Transaction::run(shared, 64, |txn| {
        attempt += 1;
        let keys = txn.list_keys("/t/", 0)?;
        if attempt == 1 {
            assert_eq!(keys, vec!["/t/a", "/t/b"]);
            db.delete("/t/b", &DeleteOptions::default())?;
        } else {
            assert_eq!(keys, vec!["/t/a"]);
        }
        txn.update("/t/a", "touched")?;
        Ok(())
    })?;

    assert_eq!(attempt, 2);
    Ok(())
}

#[test]
fn commit_applies_once_and_runs_callbacks_once() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k", "a", None)?;
    db.create("/t/counter", "0", None)?;

    let effects = Arc::new(AtomicU32::new(0));
    let mut attempt = 0;
    Transaction::run(shared, 64, |txn| {
        attempt += 1;
        let counter: u32 = txn.get("/t/counter")?.expect("seeded").parse().expect("number");
        txn.get("/t/k")?;
        if attempt == 1 {
            db.update("/t/k", "spoiler", None)?;
        }
        txn.update("/t/counter", &(counter + 1).to_string())?;
        let effects = effects.clone();
        txn.on_commit(move || {
            effects.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    })?;

    assert_eq!(attempt, 2);
    // The increment landed exactly once despite the retried body.
    assert_eq!(value(&db, "/t/counter")?, Some("1".to_owned()));
    assert_eq!(effects.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn read_only_bodies_commit_trivially() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k", "a", None)?;
    // Even with the read invalidated mid-body, a transaction with nothing
    // staged needs no verification and never retries.
    let mut attempt = 0;
    Transaction::run(shared, 0, |txn| {
        attempt += 1;
        txn.get("/t/k")?;
        db.update("/t/k", "b", None)?;
        Ok(())
    })?;
    assert_eq!(attempt, 1);
    Ok(())
}

#[test]
fn retry_bound_is_fatal() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k", "a", None)?;

    let mut attempts = 0;
    let result = Transaction::run(shared, 3, |txn| {
        attempts += 1;
        txn.get("/t/k")?;
        // Invalidate the read on every attempt; the body can never commit.
        db.update("/t/k", "spoiler", None)?;
        txn.update("/t/k", "mine")?;
        Ok(())
    });

    assert!(matches!(result, Err(Error::RetryExhausted { retries: 3 })));
    assert_eq!(attempts, 4);
    assert_eq!(value(&db, "/t/k")?, Some("spoiler".to_owned()));
    Ok(())
}

#[test]
fn watcher_wakes_on_point_change() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k", "a", None)?;

    let mut watcher = Watcher::new(shared, Some(Duration::from_secs(5)));
    let seen = watcher.txn(|txn| txn.get("/t/k"))?;
    assert_eq!(seen.as_deref(), Some("a"));

    db.update("/t/k", "b", None)?;
    assert_eq!(watcher.wait()?, Wakeup::Changed);

    let seen = watcher.txn(|txn| txn.get("/t/k"))?;
    assert_eq!(seen.as_deref(), Some("b"));
    Ok(())
}

#[test]
fn watcher_wakes_from_other_thread() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k", "a", None)?;

    let mut watcher = Watcher::new(shared, Some(Duration::from_secs(30)));
    watcher.txn(|txn| txn.get("/t/k"))?;

    let writer = db.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        writer.update("/t/k", "b", None)
    });

    let started = Instant::now();
    assert_eq!(watcher.wait()?, Wakeup::Changed);
    assert!(started.elapsed() < Duration::from_secs(30));
    handle.join().expect("writer thread")?;
    Ok(())
}

#[test]
fn range_watch_filters_value_updates() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/a", "1", None)?;

    let mut watcher = Watcher::new(shared, Some(Duration::from_millis(100)));
    assert_eq!(watcher.txn(|txn| txn.list_keys("/t/", 0))?, vec!["/t/a"]);

    // A value update of a listed (but not point-read) key is not a change.
    db.update("/t/a", "2", None)?;
    assert_eq!(watcher.wait()?, Wakeup::TimedOut);

    // A key entering the range is.
    assert_eq!(watcher.txn(|txn| txn.list_keys("/t/", 0))?, vec!["/t/a"]);
    db.create("/t/b", "1", None)?;
    assert_eq!(watcher.wait()?, Wakeup::Changed);

    // So is a key leaving it.
    assert_eq!(
        watcher.txn(|txn| txn.list_keys("/t/", 0))?,
        vec!["/t/a", "/t/b"]
    );
    db.delete("/t/b", &DeleteOptions::default())?;
    assert_eq!(watcher.wait()?, Wakeup::Changed);
    Ok(())
}

#[test]
fn new_reads_subscribe_from_their_own_revision() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/a", "1", None)?;

    let mut watcher = Watcher::new(shared, Some(Duration::from_millis(100)));
    watcher.txn(|txn| txn.get("/t/a"))?;
    assert_eq!(watcher.wait()?, Wakeup::TimedOut);

    // History accumulates on /t/b before any iteration has read it.
    db.create("/t/b", "1", None)?;
    db.update("/t/b", "2", None)?;

    // The first read of /t/b already observes that history; its fresh
    // subscription must start at the revision of this read, not at the
    // earlier iteration's pinned revision, or the replay above would
    // surface as a spurious change.
    watcher.txn(|txn| txn.get("/t/a"))?;
    let seen = watcher.txn(|txn| txn.get("/t/b"))?;
    assert_eq!(seen.as_deref(), Some("2"));
    assert_eq!(watcher.wait()?, Wakeup::TimedOut);

    // A write after the read is a real change.
    watcher.txn(|txn| txn.get("/t/b"))?;
    db.update("/t/b", "3", None)?;
    assert_eq!(watcher.wait()?, Wakeup::Changed);
    Ok(())
}

#[test]
fn watcher_timeout_and_trigger() -> CResult<()> {
    let (db, shared) = backend();
    db.create("/t/k", "a", None)?;

    let mut watcher = Watcher::new(shared, Some(Duration::from_millis(50)));
    watcher.txn(|txn| txn.get("/t/k"))?;
    assert_eq!(watcher.wait()?, Wakeup::TimedOut);

    // A trigger from another thread interrupts an indefinite wait.
    watcher.set_timeout(None);
    watcher.txn(|txn| txn.get("/t/k"))?;
    let trigger = watcher.trigger();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.trigger();
    });
    assert_eq!(watcher.wait()?, Wakeup::Triggered);
    handle.join().expect("trigger thread");
    Ok(())
}
