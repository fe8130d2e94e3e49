//! Queue and transactional flush engine.
//!
//! Captured operations wait in a FIFO queue until the logger flushes it.
//! A flush drains the queue in transactions of at most `max_bulk_log`
//! operations; each transaction also stores the checkpoint of its last
//! operation, so the persisted position never runs ahead of the persisted
//! log rows. A failed transaction is rolled back and its operations go back
//! to the head of the queue in their original order.

pub mod apply;

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::capture::QueuedOperation;
use crate::checkpoint::Checkpoint;
use crate::config::LoggerConfig;
use crate::show_cache::ShowCache;
use crate::store::AuditStore;
use crate::Result;

pub use apply::{apply_record, instance_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Flushing,
}

/// What a call to [`FlushEngine::flush`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing to write.
    Clean,
    /// Another flush was running.
    Busy,
    /// Only the position moved; it was checkpointed.
    Checkpointed(Checkpoint),
    /// Operations were applied in `batches` transactions.
    Applied { operations: usize, batches: usize },
}

#[derive(Debug)]
pub struct FlushEngine {
    code: String,
    max_bulk_log: usize,
    max_queue_events: usize,
    dry_run: bool,
    queue: VecDeque<QueuedOperation>,
    state: FlushState,
    position: Option<Checkpoint>,
    last_flushed: Option<Checkpoint>,
    paused: bool,
}

impl FlushEngine {
    pub fn new(code: impl Into<String>, config: &LoggerConfig) -> Self {
        Self {
            code: code.into(),
            max_bulk_log: config.max_bulk_log.max(1),
            max_queue_events: config.max_queue_events,
            dry_run: config.dry_run,
            queue: VecDeque::new(),
            state: FlushState::Idle,
            position: None,
            last_flushed: None,
            paused: false,
        }
    }

    /// Forgets queued operations and positions, e.g. before a restart.
    pub fn reset(&mut self, position: Option<Checkpoint>) {
        if !self.queue.is_empty() {
            info!(discarded = self.queue.len(), "Queued operations discarded");
        }
        self.queue.clear();
        self.state = FlushState::Idle;
        self.last_flushed = position.clone();
        self.position = position;
        self.paused = false;
    }

    /// Appends an operation and advances the current position to its
    /// checkpoint.
    pub fn enqueue(&mut self, operation: QueuedOperation) {
        self.position = Some(operation.checkpoint.clone());
        self.queue.push_back(operation);

        if !self.paused && self.queue.len() > self.max_queue_events {
            warn!(queued = self.queue.len(), "Queue full, pausing stream");
            self.paused = true;
        }
    }

    /// Moves the current position without queueing anything.
    pub fn set_position(&mut self, position: Checkpoint) {
        self.position = Some(position);
    }

    pub fn position(&self) -> Option<&Checkpoint> {
        self.position.as_ref()
    }

    /// Last position persisted (or, in dry run, that would have been).
    pub fn last_flushed(&self) -> Option<&Checkpoint> {
        self.last_flushed.as_ref()
    }

    /// Whether everything up to the current position is persisted.
    pub fn is_flushed(&self) -> bool {
        self.queue.is_empty() && self.position == self.last_flushed
    }

    /// Whether stream ingestion is paused until the queue drains.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued operations, head first.
    pub fn queued(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.queue.iter()
    }

    /// Writes queued operations, or just the position when nothing is queued.
    ///
    /// On error the failing batch is back at the head of the queue and the
    /// error is returned for the caller to classify.
    pub async fn flush<S: AuditStore + ?Sized>(
        &mut self,
        store: &mut S,
        cache: &mut ShowCache,
    ) -> Result<FlushOutcome> {
        if self.state == FlushState::Flushing {
            debug!("Flush already running");
            return Ok(FlushOutcome::Busy);
        }
        if self.is_flushed() {
            return Ok(FlushOutcome::Clean);
        }

        self.state = FlushState::Flushing;
        let result = if self.queue.is_empty() {
            self.checkpoint_position(store).await
        } else {
            self.flush_queue(store, cache).await
        };
        self.state = FlushState::Idle;
        result
    }

    async fn checkpoint_position<S: AuditStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<FlushOutcome> {
        let Some(position) = self.position.clone() else {
            return Ok(FlushOutcome::Clean);
        };
        self.save_checkpoint(store, &position).await?;
        self.last_flushed = Some(position.clone());
        Ok(FlushOutcome::Checkpointed(position))
    }

    async fn flush_queue<S: AuditStore + ?Sized>(
        &mut self,
        store: &mut S,
        cache: &mut ShowCache,
    ) -> Result<FlushOutcome> {
        let mut operations = 0;
        let mut batches = 0;
        cache.start_cycle();

        while !self.queue.is_empty() {
            let count = self.max_bulk_log.min(self.queue.len());
            let mut batch: Vec<QueuedOperation> = self.queue.drain(..count).collect();

            if let Err(e) = self.apply_batch(store, cache, &mut batch).await {
                warn!(error = %e, operations = batch.len(), "Batch failed, rolling back");
                if let Err(rollback) = store.rollback().await {
                    debug!(error = %rollback, "Rollback failed");
                }
                for operation in batch.into_iter().rev() {
                    self.queue.push_front(operation);
                }
                return Err(e);
            }

            operations += count;
            batches += 1;
            if let Some(last) = batch.pop() {
                self.last_flushed = Some(last.checkpoint);
            }
            debug!(applied = count, remaining = self.queue.len(), "Batch committed");
        }

        if self.paused {
            info!("Queue flushed, resuming stream");
            self.paused = false;
        }
        Ok(FlushOutcome::Applied { operations, batches })
    }

    async fn apply_batch<S: AuditStore + ?Sized>(
        &self,
        store: &mut S,
        cache: &mut ShowCache,
        batch: &mut [QueuedOperation],
    ) -> Result<()> {
        let Some(checkpoint) = batch.last().map(|operation| operation.checkpoint.clone()) else {
            return Ok(());
        };

        store.begin().await?;
        cache.get_values(store, batch).await?;
        for record in batch.iter().flat_map(|operation| operation.records.iter()) {
            apply_record(store, record, self.dry_run).await?;
        }
        self.save_checkpoint(store, &checkpoint).await?;
        store.commit().await
    }

    async fn save_checkpoint<S: AuditStore + ?Sized>(
        &self,
        store: &mut S,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        debug!(code = %self.code, position = %checkpoint, "Flush");
        if self.dry_run {
            return Ok(());
        }
        store.save_checkpoint(&self.code, checkpoint).await
    }
}
