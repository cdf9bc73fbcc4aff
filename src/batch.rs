//! Batch buffer for bulk writes
//!
//! Items accumulate in memory and are handed to a [`BulkWriter`] in one call
//! when the buffer reaches `max_size`, when `max_wait` has passed since the
//! batch window opened, on an explicit [`BatchBuffer::flush`], or on
//! shutdown. The window opens at the last flush, or when the first item
//! lands in an empty buffer, whichever is later.
//!
//! Items are removed from the buffer under its lock and written after the
//! lock is released. Bulk writes from one buffer never overlap, and none
//! carries more than `max_size` items.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::ResilienceError;
use crate::observability::Metrics;

/// Items that can be identified in a bulk write outcome
pub trait BatchItem: Send + Sync + 'static {
    fn item_id(&self) -> String;
}

/// Result of one bulk write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, ResilienceError)>,
}

impl BulkWriteOutcome {
    pub fn all_succeeded<T: BatchItem>(items: &[T]) -> Self {
        Self {
            succeeded: items.iter().map(BatchItem::item_id).collect(),
            failed: Vec::new(),
        }
    }
}

/// Downstream store that accepts many items in one operation
#[async_trait]
pub trait BulkWriter<T: BatchItem>: Send + Sync {
    /// Write `items`; an `Err` means the whole batch failed
    async fn bulk_write(&self, items: &[T]) -> Result<BulkWriteOutcome, ResilienceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Size,
    Timer,
    Manual,
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// An item the bulk write did not persist
#[derive(Debug)]
pub struct FailedItem<T> {
    /// Position within the flushed batch
    pub index: usize,
    /// Buffer-wide insertion sequence number
    pub seq: u64,
    pub id: String,
    pub item: T,
    pub error: ResilienceError,
}

/// What one flush did
#[derive(Debug)]
pub struct FlushReport<T> {
    pub trigger: FlushTrigger,
    pub attempted: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedItem<T>>,
    pub duration: Duration,
}

impl<T> FlushReport<T> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.id.clone()).collect()
    }

    /// `Err(PartialBatchFailure)` when any item failed
    pub fn ensure_complete(&self) -> Result<(), ResilienceError> {
        if self.is_complete() {
            return Ok(());
        }
        Err(ResilienceError::PartialBatchFailure {
            failed_ids: self.failed_ids(),
            total: self.attempted,
        })
    }
}

struct BufferState<T> {
    items: Vec<(u64, T)>,
    next_seq: u64,
    window_start: Instant,
    closed: bool,
}

pub struct BatchBuffer<T: BatchItem> {
    name: String,
    max_size: usize,
    max_wait: Duration,
    writer: Arc<dyn BulkWriter<T>>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    state: Mutex<BufferState<T>>,
    flush_gate: tokio::sync::Mutex<()>,
}

impl<T: BatchItem> fmt::Debug for BatchBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .field("max_wait", &self.max_wait)
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T: BatchItem> BatchBuffer<T> {
    pub fn new(
        name: impl Into<String>,
        max_size: usize,
        max_wait: Duration,
        writer: Arc<dyn BulkWriter<T>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            max_size: max_size.max(1),
            max_wait,
            writer,
            clock,
            metrics: None,
            state: Mutex::new(BufferState {
                items: Vec::new(),
                next_seq: 0,
                window_start: now,
                closed: false,
            }),
            flush_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an item, flushing when a threshold is reached
    ///
    /// Returns the flush report when this call performed a flush.
    pub async fn add(&self, item: T) -> Result<Option<FlushReport<T>>, ResilienceError> {
        let trigger = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ResilienceError::Cancelled(format!(
                    "batch buffer {} is closed",
                    self.name
                )));
            }

            let now = self.clock.now();
            if state.items.is_empty() && state.window_start + self.max_wait <= now {
                state.window_start = now;
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.items.push((seq, item));

            if state.items.len() >= self.max_size {
                Some(FlushTrigger::Size)
            } else if now.saturating_duration_since(state.window_start) >= self.max_wait {
                Some(FlushTrigger::Timer)
            } else {
                None
            }
        };

        match trigger {
            Some(trigger) => Ok(self.flush_with(trigger).await),
            None => Ok(None),
        }
    }

    /// Write everything pending; `None` when the buffer was empty
    pub async fn flush(&self) -> Option<FlushReport<T>> {
        self.flush_with(FlushTrigger::Manual).await
    }

    /// Refuse further items and flush what is left
    pub async fn close(&self) -> Option<FlushReport<T>> {
        self.state.lock().closed = true;
        self.flush_with(FlushTrigger::Shutdown).await
    }

    /// Time until the open window is due, `None` when nothing is pending
    pub fn time_until_due(&self) -> Option<Duration> {
        let state = self.state.lock();
        if state.items.is_empty() {
            return None;
        }
        Some((state.window_start + self.max_wait).saturating_duration_since(self.clock.now()))
    }

    /// Flush on the time threshold in the background
    ///
    /// Reports go to `reports` when given. Cancelling `shutdown` closes the
    /// buffer and performs a final flush.
    pub fn spawn_flush_timer(
        self: Arc<Self>,
        reports: Option<mpsc::UnboundedSender<FlushReport<T>>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = self.time_until_due().unwrap_or(self.max_wait);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
                }

                if self.time_until_due().is_some_and(|left| left.is_zero()) {
                    if let Some(report) = self.flush_with(FlushTrigger::Timer).await {
                        if let Some(tx) = &reports {
                            let _ = tx.send(report);
                        }
                    }
                }
            }

            if let Some(report) = self.close().await {
                if let Some(tx) = &reports {
                    let _ = tx.send(report);
                }
            }
            debug!(buffer = %self.name, "Batch flush timer stopped");
        })
    }

    /// Write everything pending, at most `max_size` items per bulk write
    ///
    /// Producers keep appending while an earlier flush holds the gate, so
    /// the backlog taken here can exceed `max_size`; it is split into chunks
    /// written one after another and merged into a single report.
    async fn flush_with(&self, trigger: FlushTrigger) -> Option<FlushReport<T>> {
        let _gate = self.flush_gate.lock().await;

        let taken = {
            let mut state = self.state.lock();
            state.window_start = self.clock.now();
            std::mem::take(&mut state.items)
        };
        if taken.is_empty() {
            return None;
        }

        let mut report = FlushReport {
            trigger,
            attempted: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
            duration: Duration::ZERO,
        };

        let mut remaining = taken.into_iter();
        loop {
            let (seqs, items): (Vec<u64>, Vec<T>) = remaining.by_ref().take(self.max_size).unzip();
            if items.is_empty() {
                break;
            }

            let started = Instant::now();
            let outcome = self.writer.bulk_write(&items).await;
            let duration = started.elapsed();

            let offset = report.attempted;
            let size = items.len();
            let failed_before = report.failed.len();
            record_chunk(&mut report, offset, seqs, items, outcome);
            report.duration += duration;

            if let Some(metrics) = &self.metrics {
                metrics.batch_flushed(size, report.failed.len() - failed_before, duration);
            }
        }

        if report.is_complete() {
            debug!(
                buffer = %self.name,
                %trigger,
                items = report.attempted,
                duration_ms = report.duration.as_millis() as u64,
                "Batch flushed"
            );
        } else {
            warn!(
                buffer = %self.name,
                %trigger,
                items = report.attempted,
                failed = report.failed.len(),
                "Batch flush partially failed"
            );
        }

        Some(report)
    }
}

/// Fold one bulk write into `report`; indices continue from `offset`
fn record_chunk<T: BatchItem>(
    report: &mut FlushReport<T>,
    offset: usize,
    seqs: Vec<u64>,
    items: Vec<T>,
    outcome: Result<BulkWriteOutcome, ResilienceError>,
) {
    report.attempted += items.len();
    let numbered = seqs.into_iter().zip(items).enumerate().map(|(i, pair)| (offset + i, pair));

    match outcome {
        Err(err) => {
            for (index, (seq, item)) in numbered {
                report.failed.push(FailedItem {
                    index,
                    seq,
                    id: item.item_id(),
                    item,
                    error: err.clone(),
                });
            }
        }
        Ok(outcome) => {
            let acknowledged: HashSet<String> = outcome.succeeded.into_iter().collect();
            let mut errors: HashMap<String, ResilienceError> = HashMap::new();
            for (id, err) in outcome.failed {
                errors.entry(id).or_insert(err);
            }

            for (index, (seq, item)) in numbered {
                let id = item.item_id();
                if let Some(err) = errors.get(&id) {
                    report.failed.push(FailedItem { index, seq, id, item, error: err.clone() });
                } else if acknowledged.contains(&id) {
                    report.succeeded.push(id);
                } else {
                    let error = ResilienceError::dependency(
                        "bulk-writer",
                        format!("item {id} was not acknowledged"),
                    );
                    report.failed.push(FailedItem { index, seq, id, item, error });
                }
            }
        }
    }
}

impl<T: BatchItem> Drop for BatchBuffer<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.items.is_empty() {
            let dropped: Vec<String> = state.items.iter().map(|(_, item)| item.item_id()).collect();
            warn!(
                buffer = %self.name,
                dropped = dropped.len(),
                ids = ?dropped,
                "Batch buffer dropped with unflushed items"
            );
        } else if state.closed {
            info!(buffer = %self.name, "Batch buffer closed");
        }
    }
}
