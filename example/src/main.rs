use std::sync::Arc;
use std::time::Duration;

use sdp_config::{
    Backend, CResult, Config, ConfigOptions, MemoryBackend, OwnerRecord, ProcessingBlock, Wakeup,
    WorkflowRef,
};
use serde_json::json;

fn main() {
    println!("Hello, sdp-config demo!");

    run().unwrap();

    println!("Bye~");
}

/// A controller and a worker coordinating over one in-process store: the
/// controller publishes a processing block, the worker claims it, runs it,
/// and the controller watches the state until the work is done.
fn run() -> CResult<()> {
    let store: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

    let mut options = ConfigOptions::default();
    options.owner = Some(OwnerRecord {
        pid: 1,
        hostname: "controller".to_owned(),
        command: vec!["controller".to_owned()],
    });
    let controller = Config::with_backend(store.clone(), &options)?;
    options.owner = Some(OwnerRecord {
        pid: 2,
        hostname: "worker".to_owned(),
        command: vec!["worker".to_owned()],
    });
    let worker = Config::with_backend(store, &options)?;

    // Controller publishes a processing block.
    let pb_id = controller.txn(|txn| {
        let pb_id = txn.new_processing_block_id("demo")?;
        let workflow = WorkflowRef::new("realtime", "demo_workflow", "0.1.0")?;
        txn.create_processing_block(&ProcessingBlock::new(&pb_id, None, workflow)?)?;
        Ok(pb_id)
    })?;
    println!("controller published {pb_id}");

    // Worker discovers and claims it, holding the claim under its lease.
    let lease = worker.client_lease()?;
    worker.txn(|txn| {
        txn.take_processing_block(&pb_id, &lease)?;
        txn.create_processing_block_state(&pb_id, &json!({"status": "RUNNING"}))
    })?;
    assert!(worker.txn(|txn| txn.is_processing_block_owner(&pb_id))?);
    assert!(!controller.txn(|txn| txn.is_processing_block_owner(&pb_id))?);
    println!("worker claimed {pb_id}");

    // Controller waits on the state; the worker's update wakes it.
    let mut watcher = controller.watcher(Some(Duration::from_secs(1)));
    let state = watcher.txn(|txn| txn.get_processing_block_state(&pb_id))?;
    println!("controller sees state {state:?}");

    worker.txn(|txn| txn.update_processing_block_state(&pb_id, &json!({"status": "FINISHED"})))?;
    assert_eq!(watcher.wait()?, Wakeup::Changed);

    let state = watcher.txn(|txn| txn.get_processing_block_state(&pb_id))?;
    assert_eq!(state, Some(json!({"status": "FINISHED"})));
    println!("controller sees state {state:?}");

    Ok(())
}
