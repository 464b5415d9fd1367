//! Producer/worker orchestration.
//!
//! One producer thread enumerates the item source into a bounded queue; N
//! workers each own a fully independent [`StreamAggregator`] (own mapper
//! tree, builders, and spill area). During the parallel phase the only
//! shared mutable state is the queue, the running flag, and the disk budget;
//! all cross-worker reconciliation happens afterwards via the external
//! merge.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::mapper::TableMapper;
use crate::stream::driver::{JobResult, JobStatus, Progress, StreamAggregator, WorkerParts};
use crate::stream::partition::{BatchWriter, DiskBudget};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared "still running" flag.
///
/// Cleared by a user cancel, by the first fatal worker error, or when the
/// disk budget is spent. The producer polls it between pushes; workers poll
/// it between items and always finish the item in hand.
#[derive(Debug, Clone)]
pub struct CancelToken {
    running: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn cancel(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one job across `config.workers` independent workers.
///
/// `make_mappers` builds one mapper tree per worker — worker state is never
/// shared, which is what makes the parallel phase lock-free. The final
/// result is the cross-worker merge of every worker's tables and partitions.
pub fn run_parallel<F, I>(
    make_mappers: F,
    items: I,
    config: &EngineConfig,
    progress: &Progress,
    cancel: &CancelToken,
) -> Result<JobResult>
where
    F: Fn() -> Vec<TableMapper> + Sync,
    I: IntoIterator<Item = Value>,
    I::IntoIter: Send,
{
    let workers = config.workers.max(1);
    let budget = Arc::new(DiskBudget::new(config.max_disk_bytes));
    let (tx, rx) = crossbeam_channel::bounded::<Value>(config.queue_capacity.max(1));
    let running = Arc::clone(&cancel.running);
    let items = items.into_iter();

    let results: Vec<Result<WorkerParts>> = std::thread::scope(|s| {
        let producer = {
            let running = Arc::clone(&running);
            s.spawn(move || {
                let mut count = 0u64;
                for item in items {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    if tx.send(item).is_err() {
                        break;
                    }
                    count += 1;
                    progress.loaded(count);
                }
                count
            })
        };

        let mut handles = Vec::with_capacity(workers);
        for w in 0..workers {
            let rx = rx.clone();
            let running = Arc::clone(&running);
            let budget = Arc::clone(&budget);
            let make_mappers = &make_mappers;
            handles.push(s.spawn(move || -> Result<WorkerParts> {
                let writer = match &config.spill_dir {
                    Some(dir) => Some(BatchWriter::new(
                        dir.join(format!("worker-{w}")),
                        config.codec,
                        budget,
                    )?),
                    None => None,
                };
                let mut agg =
                    StreamAggregator::with_writer(make_mappers(), config.flush_row_threshold, writer)?;
                match worker_loop(&mut agg, &rx, &running) {
                    Ok(()) => {
                        debug!("worker {w} done after {} items", agg.items_processed());
                        agg.into_parts()
                    }
                    Err(e) => {
                        // First fatal error halts the producer promptly;
                        // other workers finish their current item and exit.
                        running.store(false, Ordering::Relaxed);
                        Err(e)
                    }
                }
            }));
        }
        drop(rx);

        let produced = producer.join().unwrap_or_default();
        debug!("producer finished after {produced} items");

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(EngineError::Mapper(anyhow::anyhow!("worker panicked"))),
            })
            .collect()
    });

    let mut parts = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(part) => parts.push(part),
            Err(e) => {
                error!("worker failed: {e}");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let status = if parts.iter().any(|p| p.size_exceeded) {
        JobStatus::SizeLimitExceeded
    } else {
        JobStatus::Completed
    };
    JobResult::assemble(parts, status)
}

fn worker_loop(
    agg: &mut StreamAggregator,
    rx: &Receiver<Value>,
    running: &AtomicBool,
) -> Result<()> {
    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(item) => {
                agg.process_item(&item)?;
                if agg.should_flush() {
                    agg.flush()?;
                }
                if agg.size_exceeded() {
                    running.store(false, Ordering::Relaxed);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
