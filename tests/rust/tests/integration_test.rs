use anyhow::Result;
use checkpoint::{CheckpointLedger, SessionManager, LEDGER_FILE};
use collective::{ActivateOptions, CollectiveChannel, LocalTransport, ProcessGroupContext};
use metrics::{MetricOptions, MetricStore};
use runtime_core::{ErrorKind, FixedClock, JsonCodec, Numeric, ReduceMode, RuntimeConfig};
use std::sync::Arc;
use tempfile::TempDir;

fn single_rank(options: ActivateOptions) -> Result<(CollectiveChannel, collective::ActivationGuard)> {
    let context = ProcessGroupContext::new(LocalTransport::world(1).remove(0));
    let guard = context.activate(options)?;
    Ok((CollectiveChannel::new(context), guard))
}

#[tokio::test]
async fn test_config_driven_session() -> Result<()> {
    let root = TempDir::new()?;
    let json = serde_json::json!({
        "metrics": { "default_window": 4 },
        "checkpoint": {
            "root": root.path(),
            "session_type": "finetune",
            "num_kept": 2
        }
    });
    let config = RuntimeConfig::from_json_str(&json.to_string())?;

    let (channel, _guard) = single_rank(ActivateOptions::from_config(&config.group))?;
    let clock = FixedClock::parse("2024-02-29 23:59:59")?;
    let session = SessionManager::from_config(&config.checkpoint, &channel, &clock)?;
    session.make_session_path(&channel)?;

    let store = MetricStore::from_config(&config.metrics);
    for step in 0..3u64 {
        store.submit_metric("loss", 1.0 / (step as f64 + 1.0), None, step, MetricOptions::new(ReduceMode::Mean))?;
        store.synchronize(&channel, "loss", None)?;
        session.save(&store.get_value("loss", None)?, step).await?;
    }

    assert_eq!(store.steps("loss")?, vec![0, 1, 2]);
    assert_eq!(
        session.ledger().entries().await?,
        vec!["model_1.bin", "model_2.bin"]
    );
    assert!(session
        .current_session_path()
        .ends_with("finetune/2024-02-29 23:59:59"));

    let latest: Numeric = session.load(None).await?;
    assert_eq!(latest.as_f64(), Some(1.0 / 3.0));
    Ok(())
}

#[tokio::test]
async fn test_processes_share_session_directory() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("train").join("2024-01-01 00:00:00");

    // Two independent writers, as two processes would be.
    let writers: Vec<_> = (0..2u64)
        .map(|writer| {
            let path = path.clone();
            tokio::spawn(async move {
                let ledger = CheckpointLedger::with_codec(&path, JsonCodec, 0);
                for i in 0..10u64 {
                    ledger.save(&vec![writer, i], writer * 1000 + i).await?;
                }
                Ok::<_, runtime_core::Error>(())
            })
        })
        .collect();
    for writer in writers {
        writer.await??;
    }

    let ledger = CheckpointLedger::with_codec(&path, JsonCodec, 0);
    let entries = ledger.entries().await?;
    assert_eq!(entries.len(), 20);
    for entry in &entries {
        assert!(path.join(entry).exists(), "{} must exist", entry);
    }

    let raw = std::fs::read_to_string(path.join(LEDGER_FILE))?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(parsed["checkpoints"].as_array().map(Vec::len), Some(20));
    Ok(())
}

#[tokio::test]
async fn test_error_classification() -> Result<()> {
    let dir = TempDir::new()?;
    let ledger = CheckpointLedger::new(dir.path(), 3);

    let missing = ledger.load::<Vec<u8>>(Some(42)).await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
    assert!(missing.is_recoverable());

    let store = MetricStore::default();
    store.submit_metric("loss", 1.0, None, 5, MetricOptions::default())?;
    let out_of_order = store
        .submit_metric("loss", 1.0, None, 4, MetricOptions::default())
        .unwrap_err();
    assert_eq!(out_of_order.kind(), ErrorKind::Ordering);
    assert!(out_of_order.is_fatal());

    let (channel, _guard) = single_rank(ActivateOptions::enabled().with_local_rank(0))?;
    let mismatch = channel.broadcast(1u8, 1).unwrap_err();
    assert_eq!(mismatch.kind(), ErrorKind::Programmer);
    Ok(())
}

#[test]
fn test_reactivation_after_teardown() -> Result<()> {
    let context = ProcessGroupContext::new(LocalTransport::world(1).remove(0));

    for _ in 0..3 {
        let guard = context.activate(ActivateOptions::enabled().with_local_rank(0))?;
        let channel = CollectiveChannel::new(Arc::clone(&context));
        context.register_extra_group()?;
        channel.barrier()?;
        assert_eq!(channel.all_reduce(Numeric::Int(3))?, Numeric::Int(3));
        guard.deactivate()?;
        assert!(!context.is_activated());
    }
    Ok(())
}

#[test]
fn test_logging_init_is_idempotent() {
    let _first = runtime_core::logging::init("info");
    assert!(!runtime_core::logging::init("debug"));
    tracing::info!("logging initialized");
}
