// src/matching/stage.rs
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::MultiProgress;
use log::{debug, error};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::error::MatchError;
use crate::models::core::{CustomerId, CustomerRecord};
use crate::models::stats_models::StageStats;
use crate::utils::cancel::CancelSignal;
use crate::utils::logging::StageLogger;
use crate::utils::progress_config::stage_bar;

/// Worker pool shape shared by the keying and weighting stages.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Capacity of both the work queue and the result queue.
    pub queue_capacity: usize,
    /// Rows per bulk persistence call.
    pub persist_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1000,
            persist_batch_size: 1000,
        }
    }
}

/// What a worker reports for one record.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Computed { customer_id: CustomerId, output: Vec<T> },
    Rejected { customer_id: CustomerId, reason: MatchError },
}

async fn flush_batch<T, P, Fut>(
    batch: Vec<T>,
    persist: &mut P,
    stats: &mut StageStats,
    cancel: &CancelSignal,
    logger: &StageLogger,
) -> Result<()>
where
    P: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    cancel.check("persistence")?;
    let rows = persist(batch).await?;
    stats.persisted += rows;
    stats.persistence_calls += 1;
    logger.log_flush(stats.persistence_calls, rows);
    Ok(())
}

/// Runs `compute` over `records` on a bounded worker pool and persists the
/// outputs in fixed-size batches.
///
/// A single intake task fills the work queue and closes it when done. Workers
/// share the queue and push typed outcomes to the result queue. The result
/// queue is closed only after every worker has been joined. The calling task
/// aggregates and is the only caller of `persist`, so batches are flushed
/// strictly one at a time. Rejected records are counted and logged; a
/// persistence error or cancellation aborts the stage.
#[allow(clippy::too_many_arguments)]
pub async fn drive_stage<T, C, P, Fut>(
    logger: &StageLogger,
    stage_name: &str,
    records: Vec<CustomerRecord>,
    config: &PipelineConfig,
    cancel: &CancelSignal,
    progress: Option<&MultiProgress>,
    compute: C,
    mut persist: P,
) -> Result<StageStats>
where
    T: Send + 'static,
    C: Fn(&CustomerRecord) -> Result<Vec<T>, MatchError> + Send + Sync + 'static,
    P: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    let start = Instant::now();
    let mut stats = StageStats::new(stage_name);
    let total = records.len();
    let batch_size = config.persist_batch_size.max(1);
    logger.log_start(total, config.workers);
    cancel.check(stage_name)?;

    let (work_tx, work_rx) = mpsc::channel::<CustomerRecord>(config.queue_capacity.max(1));
    let (result_tx, mut result_rx) = mpsc::channel::<StageOutcome<T>>(config.queue_capacity.max(1));
    let work_rx = Arc::new(Mutex::new(work_rx));
    let compute = Arc::new(compute);

    let intake_cancel = cancel.clone();
    let intake = tokio::spawn(async move {
        for record in records {
            tokio::select! {
                biased;
                _ = intake_cancel.cancelled() => {
                    return Err(MatchError::Cancelled("cancelled during intake".to_string()));
                }
                sent = work_tx.send(record) => {
                    if sent.is_err() {
                        // every worker is gone, the stage is being torn down
                        break;
                    }
                }
            }
        }
        Ok(())
    });

    let mut workers = JoinSet::new();
    for worker_id in 0..config.workers.max(1) {
        let work_rx = Arc::clone(&work_rx);
        let result_tx = result_tx.clone();
        let compute = Arc::clone(&compute);
        let cancel = cancel.clone();
        workers.spawn(async move {
            let mut handled = 0usize;
            loop {
                let next = {
                    let mut queue = work_rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        record = queue.recv() => record,
                    }
                };
                let Some(record) = next else { break };

                let outcome = match compute(&record) {
                    Ok(output) => StageOutcome::Computed {
                        customer_id: record.customer_id,
                        output,
                    },
                    Err(reason) => StageOutcome::Rejected {
                        customer_id: record.customer_id,
                        reason,
                    },
                };
                handled += 1;

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = result_tx.send(outcome) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            (worker_id, handled)
        });
    }

    // Barrier: the original result sender is released only after all workers joined.
    let barrier = tokio::spawn(async move {
        let mut failed = 0usize;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((worker_id, handled)) => debug!("Worker {} finished after {} records", worker_id, handled),
                Err(e) => {
                    error!("Stage worker failed (JoinError): {}", e);
                    failed += 1;
                }
            }
        }
        drop(result_tx);
        failed
    });

    let pb = stage_bar(progress, total as u64, stage_name)?;
    let mut buffer: Vec<T> = Vec::with_capacity(batch_size.min(total.max(1)));

    let aggregated: Result<()> = async {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(MatchError::Cancelled(format!("cancelled during {}", stage_name)).into());
                }
                outcome = result_rx.recv() => outcome,
            };
            let Some(outcome) = next else { break };
            stats.received += 1;
            pb.inc(1);
            match outcome {
                StageOutcome::Computed { output, .. } => {
                    stats.emitted += 1;
                    buffer.extend(output);
                }
                StageOutcome::Rejected { customer_id, reason } => {
                    stats.dropped += 1;
                    logger.log_dropped(customer_id, &reason.to_string());
                }
            }
            while buffer.len() >= batch_size {
                let batch: Vec<T> = buffer.drain(..batch_size).collect();
                flush_batch(batch, &mut persist, &mut stats, cancel, logger).await?;
            }
        }
        if !buffer.is_empty() {
            let batch = std::mem::take(&mut buffer);
            flush_batch(batch, &mut persist, &mut stats, cancel, logger).await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = aggregated {
        intake.abort();
        barrier.abort();
        pb.abandon_with_message(format!("{} aborted", stage_name));
        logger.log_error(&format!("Stage aborted: {:#}", e));
        return Err(e);
    }

    intake
        .await
        .context("Intake task failed")??;
    let failed_workers = barrier.await.context("Worker barrier task failed")?;
    if failed_workers > 0 {
        return Err(anyhow::anyhow!(
            "{} of {} {} workers failed",
            failed_workers,
            config.workers,
            stage_name
        ));
    }

    pb.finish_with_message(format!("{} complete", stage_name));
    stats.finish(start.elapsed());
    logger.log_completion(&stats);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::logging::StageKind;

    fn records(n: usize) -> Vec<CustomerRecord> {
        (0..n)
            .map(|i| CustomerRecord {
                customer_id: i as i32 + 1,
                street: if i % 10 == 9 { String::new() } else { format!("{} oak ave", i) },
                ..Default::default()
            })
            .collect()
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            workers: 4,
            queue_capacity: 8,
            persist_batch_size: 25,
        }
    }

    fn street_len(record: &CustomerRecord) -> Result<Vec<usize>, MatchError> {
        if record.street.is_empty() {
            Err(MatchError::Input("empty street".into()))
        } else {
            Ok(vec![record.street.len()])
        }
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_persistence_calls() {
        let logger = StageLogger::new(StageKind::Keying, 1);
        let calls = Arc::new(Mutex::new(0usize));
        let calls_clone = Arc::clone(&calls);
        let stats = drive_stage(
            &logger,
            "keying",
            Vec::new(),
            &small_config(),
            &CancelSignal::new(),
            None,
            street_len,
            move |batch: Vec<usize>| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    *calls.lock().await += 1;
                    Ok(batch.len())
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(stats.persistence_calls, 0);
        assert_eq!(stats.received, 0);
        assert_eq!(*calls.lock().await, 0);
    }

    #[tokio::test]
    async fn test_batches_and_drops() {
        let logger = StageLogger::new(StageKind::Keying, 1);
        let sink = Arc::new(Mutex::new(Vec::new()));
        let sink_clone = Arc::clone(&sink);
        let stats = drive_stage(
            &logger,
            "keying",
            records(100),
            &small_config(),
            &CancelSignal::new(),
            None,
            street_len,
            move |batch: Vec<usize>| {
                let sink = Arc::clone(&sink_clone);
                async move {
                    assert!(batch.len() <= 25);
                    let n = batch.len();
                    sink.lock().await.extend(batch);
                    Ok(n)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.received, 100);
        assert_eq!(stats.emitted, 90);
        assert_eq!(stats.dropped, 10);
        assert_eq!(stats.persisted, 90);
        // 25 + 25 + 25 + 15
        assert_eq!(stats.persistence_calls, 4);
        assert_eq!(sink.lock().await.len(), 90);
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_stage() {
        let logger = StageLogger::new(StageKind::Weighting, 2);
        let mut calls = 0usize;
        let err = drive_stage(
            &logger,
            "weighting",
            records(100),
            &small_config(),
            &CancelSignal::new(),
            None,
            street_len,
            move |batch: Vec<usize>| {
                calls += 1;
                let fail = calls == 2;
                async move {
                    if fail {
                        Err(anyhow::anyhow!("connection reset")).context(MatchError::storage("upsert failed"))
                    } else {
                        Ok(batch.len())
                    }
                }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(MatchError::classify(&err), Some(MatchError::Storage(_))));
    }

    #[tokio::test]
    async fn test_cancelled_stage_returns_cancelled() {
        let logger = StageLogger::new(StageKind::Keying, 3);
        let cancel = CancelSignal::new();
        cancel.cancel();
        let err = drive_stage(
            &logger,
            "keying",
            records(50),
            &small_config(),
            &cancel,
            None,
            street_len,
            |batch: Vec<usize>| async move { Ok(batch.len()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(MatchError::classify(&err), Some(MatchError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_cancel_mid_stage_stops_persisting() {
        let logger = StageLogger::new(StageKind::Keying, 4);
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        let persisted = Arc::new(Mutex::new(0usize));
        let persisted_clone = Arc::clone(&persisted);
        let err = drive_stage(
            &logger,
            "keying",
            records(500),
            &PipelineConfig {
                workers: 2,
                queue_capacity: 4,
                persist_batch_size: 10,
            },
            &cancel,
            None,
            street_len,
            move |batch: Vec<usize>| {
                let persisted = Arc::clone(&persisted_clone);
                let trigger = trigger.clone();
                async move {
                    *persisted.lock().await += batch.len();
                    trigger.cancel();
                    Ok(batch.len())
                }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(MatchError::classify(&err), Some(MatchError::Cancelled(_))));
        assert!(*persisted.lock().await < 450);
    }
}
