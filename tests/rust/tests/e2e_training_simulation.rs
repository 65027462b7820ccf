//! End-to-end training simulation
//!
//! Runs several ranks as threads over the in-process transport:
//! - Activation and identity queries
//! - Per-step metric submission and cross-rank synchronization
//! - Master-only checkpointing into a shared session with rotation
//! - Restoring the finished session from disk

use anyhow::{ensure, Result};
use checkpoint::SessionManager;
use collective::{ActivateOptions, CollectiveChannel, LocalTransport, ProcessGroupContext};
use metrics::{MetricOptions, MetricStore};
use runtime_core::{FixedClock, Numeric, ReduceMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const WORLD_SIZE: usize = 4;
const STEPS: u64 = 6;
const NUM_KEPT: i64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TrainState {
    step: u64,
    mean_loss: f64,
    samples_seen: i64,
}

#[derive(Debug)]
struct RankReport {
    rank: usize,
    session_path: PathBuf,
    losses: Vec<f64>,
    samples: Vec<i64>,
    final_state: TrainState,
}

/// Loss contributed by `rank` at `step`, with `rank + 1` samples
fn local_loss(rank: usize, step: u64) -> f64 {
    (rank as f64 + 1.0) / (step as f64 + 1.0)
}

/// Sample-weighted mean of every rank's loss at `step`
fn expected_mean_loss(step: u64) -> f64 {
    let (weighted, count) = (0..WORLD_SIZE).fold((0.0, 0.0), |(w, c), rank| {
        let samples = rank as f64 + 1.0;
        (w + local_loss(rank, step) * samples, c + samples)
    });
    weighted / count
}

fn run_rank(transport: Arc<LocalTransport>, root: PathBuf) -> Result<RankReport> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let context = ProcessGroupContext::new(transport);
    let rank = context.transport().rank();
    let guard = context.activate(ActivateOptions::enabled().with_local_rank(rank % 2))?;
    let channel = CollectiveChannel::new(Arc::clone(&context));

    ensure!(context.size()? == WORLD_SIZE);
    ensure!(context.is_master() == (rank == 0));

    // Ranks start with skewed clocks; the session is stamped by rank 0.
    let clock = FixedClock::parse(&format!("2024-07-0{} 09:15:00", rank + 1))?;
    let session = SessionManager::from_session_type(&root, "train", NUM_KEPT, &channel, &clock)?;
    let session_path = session.make_session_path(&channel)?;

    let store = MetricStore::new(2);
    let mean = MetricOptions::new(ReduceMode::GlobalMean);
    let sum = MetricOptions::new(ReduceMode::Sum).with_window(STEPS as usize);

    let mut losses = Vec::new();
    let mut samples = Vec::new();
    for step in 0..STEPS {
        let batch = rank as i64 + 1;
        store.submit_metric("loss", local_loss(rank, step), Some(Numeric::Int(batch)), step, mean)?;
        store.submit_metric("samples", batch, None, step, sum)?;

        let pending = store.synchronize_async(&channel, "loss", Some(step))?;
        store.synchronize(&channel, "samples", None)?;
        pending.wait()?;

        let loss = store
            .get_value("loss", None)?
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("loss is not a scalar"))?;
        let seen = store
            .get_value("samples", None)?
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("samples is not an integer"))?;
        losses.push(loss);
        samples.push(seen);

        if context.is_master() {
            let state = TrainState {
                step,
                mean_loss: loss,
                samples_seen: seen,
            };
            runtime.block_on(session.save(&state, step))?;
        }
        channel.barrier()?;
    }

    ensure!(store.len("loss")? == 2, "loss window keeps two steps");
    ensure!(store.len("samples")? == STEPS as usize);

    let final_state: TrainState = runtime.block_on(session.load(None))?;
    guard.deactivate()?;

    Ok(RankReport {
        rank,
        session_path,
        losses,
        samples,
        final_state,
    })
}

#[test]
fn test_distributed_training_run() -> Result<()> {
    let root = TempDir::new()?;

    let handles: Vec<_> = LocalTransport::world_with_timeout(WORLD_SIZE, Duration::from_secs(30))
        .into_iter()
        .map(|transport| {
            let root = root.path().to_path_buf();
            thread::spawn(move || run_rank(transport, root))
        })
        .collect();

    let mut reports = Vec::new();
    for handle in handles {
        let report = handle
            .join()
            .map_err(|_| anyhow::anyhow!("rank thread panicked"))??;
        reports.push(report);
    }

    let expected_path = root.path().join("train").join("2024-07-01 09:15:00");
    let total_samples = (1..=WORLD_SIZE as i64).sum::<i64>();

    for report in &reports {
        assert_eq!(report.session_path, expected_path, "rank {}", report.rank);
        for (step, loss) in report.losses.iter().enumerate() {
            assert!((loss - expected_mean_loss(step as u64)).abs() < 1e-12);
        }
        assert!(report.samples.iter().all(|s| *s == total_samples));
        assert_eq!(report.final_state.step, STEPS - 1);
        assert_eq!(report.final_state, reports[0].final_state);
    }

    // Rotation kept the newest NUM_KEPT checkpoints.
    let mut artifacts: Vec<_> = std::fs::read_dir(&expected_path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("model_"))
        .collect();
    artifacts.sort();
    assert_eq!(artifacts, vec!["model_3.bin", "model_4.bin", "model_5.bin"]);

    Ok(())
}

#[tokio::test]
async fn test_restore_after_run() -> Result<()> {
    let root = TempDir::new()?;

    // A finished single-rank run.
    {
        let context = ProcessGroupContext::new(LocalTransport::world(1).remove(0));
        let _guard = context.activate(ActivateOptions::disabled())?;
        let channel = CollectiveChannel::new(Arc::clone(&context));
        let clock = FixedClock::parse("2024-07-01 09:15:00")?;

        let session = SessionManager::from_session_type(root.path(), "train", NUM_KEPT, &channel, &clock)?;
        session.make_session_path(&channel)?;
        for step in 0..STEPS {
            let state = TrainState {
                step,
                mean_loss: 1.0 / (step as f64 + 1.0),
                samples_seen: step as i64 * 8,
            };
            session.save(&state, step).await?;
        }
    }

    // Resume from the session type directory.
    let restored = SessionManager::from_restore_path(root.path().join("train"), NUM_KEPT)?;
    assert_eq!(restored.restore_step(), Some(STEPS - 1));
    let state: TrainState = restored.load(None).await?;
    assert_eq!(state.step, STEPS - 1);

    // An evicted step is a recoverable miss.
    let err = restored.load::<TrainState>(Some(0)).await.unwrap_err();
    assert!(err.is_recoverable());

    // Continue training in the restored session.
    let next = TrainState {
        step: STEPS,
        mean_loss: 0.1,
        samples_seen: 0,
    };
    restored.save(&next, STEPS).await?;
    assert_eq!(restored.ledger().entries().await?.len(), NUM_KEPT as usize);
    assert_eq!(restored.ledger().latest_step().await?, Some(STEPS));

    Ok(())
}
