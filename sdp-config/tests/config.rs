//! High-level keyspace and entity behavior against the in-memory backend.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use sdp_config::{
    Backend, BackendKind, CResult, Config, ConfigOptions, Deployment, Error, MemoryBackend,
    OwnerRecord, ProcessingBlock, WorkflowRef,
};
use serde_json::json;

fn memory_options() -> ConfigOptions {
    let mut options = ConfigOptions::default();
    options.backend = BackendKind::Memory;
    options
}

fn config() -> CResult<Config> {
    Config::new(memory_options())
}

fn workflow() -> WorkflowRef {
    WorkflowRef::new("realtime", "test_rt_workflow", "0.0.1").expect("valid workflow ref")
}

#[test]
fn processing_block_lifecycle() -> CResult<()> {
    let cfg = config()?;

    let (pb1_id, pb2_id) = cfg.txn(|txn| {
        let pb1_id = txn.new_processing_block_id("test")?;
        let pb1 = ProcessingBlock::new(&pb1_id, None, workflow())?;
        assert!(txn.get_processing_block(&pb1_id)?.is_none());
        txn.create_processing_block(&pb1)?;
        assert!(matches!(txn.create_processing_block(&pb1), Err(Error::Collision { .. })));
        assert_eq!(txn.get_processing_block(&pb1_id)?.expect("created").id, pb1_id);

        // The second generated ID accounts for the staged first block.
        let pb2_id = txn.new_processing_block_id("test")?;
        assert_ne!(pb1_id, pb2_id);
        txn.create_processing_block(&ProcessingBlock::new(&pb2_id, None, workflow())?)?;

        assert_eq!(txn.list_processing_blocks("")?, vec![pb1_id.clone(), pb2_id.clone()]);
        Ok((pb1_id, pb2_id))
    })?;

    // Make sure it stuck.
    cfg.txn(|txn| {
        assert_eq!(txn.list_processing_blocks("")?, vec![pb1_id.clone(), pb2_id.clone()]);
        Ok(())
    })?;

    // Updates round-trip, including free-form parameters and dependencies.
    let mut pb1 = cfg.txn(|txn| Ok(txn.get_processing_block(&pb1_id)?.expect("exists")))?;
    pb1.parameters = json!({"test": "test"});
    pb1.dependencies.push(json!({"pb_id": pb2_id, "type": []}));
    cfg.txn(|txn| txn.update_processing_block(&pb1))?;
    cfg.txn(|txn| {
        let read = txn.get_processing_block(&pb1_id)?.expect("exists");
        assert_eq!(read.sbi_id, None);
        assert_eq!(read, pb1);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn processing_block_id_format() -> CResult<()> {
    let cfg = config()?;
    let pb_id = cfg.txn(|txn| txn.new_processing_block_id("test"))?;

    let today = chrono::Local::now().format("%Y%m%d").to_string();
    assert_eq!(pb_id, format!("pb-test-{today}-00000"));
    Ok(())
}

#[test]
fn ownership_is_per_client() -> CResult<()> {
    let store: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

    let mut options = memory_options();
    options.owner = Some(OwnerRecord {
        pid: 1,
        hostname: "alpha".to_owned(),
        command: vec!["worker".to_owned()],
    });
    let alpha = Config::with_backend(store.clone(), &options)?;
    options.owner = Some(OwnerRecord {
        pid: 2,
        hostname: "beta".to_owned(),
        command: vec!["worker".to_owned()],
    });
    let beta = Config::with_backend(store, &options)?;

    let pb_id = alpha.txn(|txn| {
        let pb_id = txn.new_processing_block_id("own")?;
        txn.create_processing_block(&ProcessingBlock::new(&pb_id, None, workflow())?)?;
        Ok(pb_id)
    })?;

    let lease = alpha.client_lease()?;
    alpha.txn(|txn| txn.take_processing_block(&pb_id, &lease))?;

    assert!(alpha.txn(|txn| txn.is_processing_block_owner(&pb_id))?);
    assert!(!beta.txn(|txn| txn.is_processing_block_owner(&pb_id))?);
    assert_eq!(
        beta.txn(|txn| txn.get_processing_block_owner(&pb_id))?,
        Some(alpha.owner().clone())
    );

    // The claim is exclusive while the owner key exists.
    let beta_lease = beta.client_lease()?;
    let result = beta.txn(|txn| txn.take_processing_block(&pb_id, &beta_lease));
    assert!(matches!(result, Err(Error::Collision { .. })));
    Ok(())
}

#[test]
fn processing_block_state() -> CResult<()> {
    let cfg = config()?;
    let pb_id = cfg.txn(|txn| {
        let pb_id = txn.new_processing_block_id("state")?;
        txn.create_processing_block(&ProcessingBlock::new(&pb_id, None, workflow())?)?;
        Ok(pb_id)
    })?;

    cfg.txn(|txn| {
        assert_eq!(txn.get_processing_block_state(&pb_id)?, None);
        txn.create_processing_block_state(&pb_id, &json!({"status": "RUNNING"}))?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(txn.get_processing_block_state(&pb_id)?, Some(json!({"status": "RUNNING"})));
        txn.update_processing_block_state(&pb_id, &json!({"status": "FINISHED"}))?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(txn.get_processing_block_state(&pb_id)?, Some(json!({"status": "FINISHED"})));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn master_state() -> CResult<()> {
    let cfg = config()?;
    cfg.txn(|txn| {
        assert_eq!(txn.get_master()?, None);
        txn.create_master(&json!({"state": "standby"}))?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(txn.get_master()?, Some(json!({"state": "standby"})));
        txn.update_master(&json!({"state": "on"}))?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(txn.get_master()?, Some(json!({"state": "on"})));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn scheduling_blocks_and_subarrays() -> CResult<()> {
    let cfg = config()?;
    cfg.txn(|txn| {
        txn.create_scheduling_block("sbi-20240101-test", &json!({"status": "ACTIVE"}))?;
        txn.create_subarray("01", &json!({"state": "ON"}))?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(txn.list_scheduling_blocks("")?, vec!["sbi-20240101-test"]);
        assert_eq!(
            txn.get_scheduling_block("sbi-20240101-test")?,
            Some(json!({"status": "ACTIVE"}))
        );
        txn.update_scheduling_block("sbi-20240101-test", &json!({"status": "FINISHED"}))?;

        assert_eq!(txn.list_subarrays("")?, vec!["01"]);
        txn.update_subarray("01", &json!({"state": "OFF"}))?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(txn.get_subarray("01")?, Some(json!({"state": "OFF"})));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn workflow_definitions() -> CResult<()> {
    let cfg = config()?;
    let batch = WorkflowRef::new("batch", "test_batch", "0.2.0")?;
    let realtime = workflow();

    cfg.txn(|txn| {
        txn.create_workflow(&batch, &json!({"image": "workflow-test-batch:0.2.0"}))?;
        txn.create_workflow(&realtime, &json!({"image": "workflow-test-rt:0.0.1"}))?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(
            txn.list_workflows("", "")?,
            vec!["batch:test_batch:0.2.0", "realtime:test_rt_workflow:0.0.1"]
        );
        assert_eq!(txn.list_workflows("batch", "")?, vec!["batch:test_batch:0.2.0"]);
        assert_eq!(txn.list_workflows("batch", "test_batch")?, vec!["batch:test_batch:0.2.0"]);
        assert!(txn.list_workflows("batch", "other")?.is_empty());

        assert_eq!(
            txn.get_workflow(&batch)?,
            Some(json!({"image": "workflow-test-batch:0.2.0"}))
        );
        txn.update_workflow(&batch, &json!({"image": "workflow-test-batch:0.2.1"}))?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(
            txn.get_workflow(&batch)?,
            Some(json!({"image": "workflow-test-batch:0.2.1"}))
        );
        txn.delete_workflow(&batch)?;
        Ok(())
    })?;
    cfg.txn(|txn| {
        assert_eq!(txn.get_workflow(&batch)?, None);
        assert_eq!(txn.list_workflows("", "")?, vec!["realtime:test_rt_workflow:0.0.1"]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn deployments() -> CResult<()> {
    let cfg = config()?;
    let deployment = Deployment::new(
        "proc-pb-test-001",
        "helm",
        json!({"chart": "receiver", "values": {"replicas": 2}}),
    )?;

    cfg.txn(|txn| txn.create_deployment(&deployment))?;
    cfg.txn(|txn| {
        assert_eq!(txn.list_deployments("")?, vec!["proc-pb-test-001"]);
        assert_eq!(txn.get_deployment("proc-pb-test-001")?, Some(deployment.clone()));
        Ok(())
    })?;
    cfg.txn(|txn| txn.delete_deployment(&deployment))?;
    cfg.txn(|txn| {
        assert!(txn.list_deployments("")?.is_empty());
        assert_eq!(txn.get_deployment("proc-pb-test-001")?, None);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn global_prefix_scopes_all_keys() -> CResult<()> {
    let store: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

    let mut options = memory_options();
    options.global_prefix = "/site".to_owned();
    let scoped = Config::with_backend(store.clone(), &options)?;
    let unscoped = Config::with_backend(store.clone(), &memory_options())?;

    scoped.txn(|txn| txn.create_master(&json!({"state": "standby"})))?;
    assert!(store.get("/site/master", None)?.0.is_some());
    unscoped.txn(|txn| {
        assert_eq!(txn.get_master()?, None);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn owner_record_captures_process_identity() {
    let owner = OwnerRecord::capture();
    assert_eq!(owner.pid, std::process::id());
    assert!(!owner.hostname.is_empty());
    assert!(!owner.command.is_empty());
}

#[test]
fn values_are_stored_as_stable_json() -> CResult<()> {
    let cfg = config()?;
    cfg.txn(|txn| txn.create_master(&json!({"b": 1, "a": 2})))?;
    let raw = cfg.txn(|txn| txn.raw().get("/master"))?;
    assert_eq!(raw.as_deref(), Some("{\n  \"a\": 2,\n  \"b\": 1\n}"));
    Ok(())
}
