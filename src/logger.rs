//! Connection lifecycle of the audit logger.
//!
//! ```text
//! Stopped -> Initializing -> Streaming <-> Backpressured -> Ending -> Stopped
//!                 ^                                           |
//!                 +---------------- Restarting <--------------+
//! ```
//!
//! Every (re)start opens a new [`Session`] owning the audit store connection,
//! the stream, the capture engine, the queue and the display cache. A session
//! never outlives the state that created it: on any failure it is ended and
//! dropped, and a restart builds a fresh one from the persisted checkpoint.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CaptureEngine, QueuedOperation};
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::model::loader::LoadedModel;
use crate::model::ModelLoader;
use crate::queue::{FlushEngine, FlushOutcome};
use crate::show_cache::ShowCache;
use crate::store::{AuditStore, StoreConnector};
use crate::stream::{ChangeStream, StartPosition, StreamConnector, StreamEvent, StreamOptions};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    Stopped,
    Initializing,
    Streaming,
    /// Stream ingestion paused until the queue drains.
    Backpressured,
    Ending,
    Restarting,
}

/// How a streaming session ended.
enum Exit {
    Shutdown,
    Failed(Error),
}

pub struct AuditLogger<C: StoreConnector, T: StreamConnector> {
    config: Config,
    store_connector: C,
    stream_connector: T,
    loader: ModelLoader,
    model: LoadedModel,
    state: watch::Sender<LoggerState>,
}

impl<C: StoreConnector, T: StreamConnector> AuditLogger<C, T> {
    /// Builds the logger and checks the log definitions. Nothing is connected
    /// until [`run`](Self::run).
    pub fn new(config: Config, store_connector: C, stream_connector: T) -> Result<Self> {
        let loader = ModelLoader::new(
            config.model.clone(),
            config.logs.clone(),
            config.source.database.clone(),
        )?;
        let model = loader.load();
        let (state, _) = watch::channel(LoggerState::Stopped);

        Ok(Self {
            config,
            store_connector,
            stream_connector,
            loader,
            model,
            state,
        })
    }

    /// Lifecycle state updates.
    pub fn subscribe(&self) -> watch::Receiver<LoggerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LoggerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: LoggerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "Logger state");
            *current = state;
            true
        });
    }

    /// Runs until `shutdown` completes or a fatal error occurs.
    ///
    /// The first start must succeed. Afterwards, lost connections restart the
    /// pipeline after `restart_timeout_secs`, as many times as needed.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut started = false;

        loop {
            self.set_state(LoggerState::Initializing);
            let init = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.set_state(LoggerState::Stopped);
                    return Ok(());
                }
                init = self.init() => init,
            };

            let exit = match init {
                Ok(session) => {
                    if started {
                        info!("Process restarted");
                    }
                    started = true;
                    self.stream(session, &mut shutdown).await
                }
                Err(e) => Exit::Failed(e),
            };

            match exit {
                Exit::Shutdown => {
                    info!("Audit logger stopped");
                    self.set_state(LoggerState::Stopped);
                    return Ok(());
                }
                Exit::Failed(e) if started && e.is_connection_lost() => {
                    let delay = self.config.logger.restart_timeout();
                    warn!(error = %e, delay_secs = delay.as_secs(), "Connection lost, restarting");
                    self.set_state(LoggerState::Restarting);
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => {
                            self.set_state(LoggerState::Stopped);
                            return Ok(());
                        }
                        _ = sleep(delay) => {}
                    }
                }
                Exit::Failed(e) => {
                    error!(error = %e, "Fatal error, stopping");
                    self.set_state(LoggerState::Stopped);
                    return Err(e);
                }
            }
        }
    }

    async fn init(&self) -> Result<Session<C::Store, T::Stream>> {
        let mut store = self.store_connector.connect().await?;
        match self.open_session(&mut store).await {
            Ok((capture, cache, checkpoint)) => {
                let options = StreamOptions {
                    include: self.model.include_filter(),
                    start: match &checkpoint {
                        Some(checkpoint) => StartPosition::At(checkpoint.clone()),
                        None => StartPosition::End,
                    },
                    server_id: self.config.source.server_id,
                };
                let stream = match self.stream_connector.connect(&options).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        close_quietly(&mut store).await;
                        return Err(e);
                    }
                };

                let mut engine = FlushEngine::new(self.config.code.clone(), &self.config.logger);
                engine.reset(checkpoint.clone());

                info!(code = %self.config.code, start = ?options.start, "Audit logger initialized");
                Ok(Session {
                    store,
                    stream,
                    capture,
                    engine,
                    cache,
                    resume: checkpoint,
                })
            }
            Err(e) => {
                close_quietly(&mut store).await;
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        store: &mut C::Store,
    ) -> Result<(CaptureEngine, ShowCache, Option<Checkpoint>)> {
        store.prepare(&self.model.logs).await?;

        let schema_map = self.loader.resolve(&self.model, store).await?;
        let mut cache = ShowCache::new(
            self.config.show_cache.clone(),
            self.config.model.show_fields.clone(),
        );
        let schema_map = cache.refresh_schema(store, &schema_map).await?;

        let checkpoint = store.load_checkpoint(&self.config.code).await?;
        match &checkpoint {
            Some(checkpoint) => info!(position = %checkpoint, "Resuming from checkpoint"),
            None => info!("No checkpoint, starting at stream end"),
        }
        Ok((CaptureEngine::new(Arc::new(schema_map)), cache, checkpoint))
    }

    async fn stream<F>(
        &self,
        mut session: Session<C::Store, T::Stream>,
        shutdown: &mut Pin<&mut F>,
    ) -> Exit
    where
        F: Future<Output = ()> + Send,
    {
        let settings = &self.config.logger;
        let flush_interval = settings.flush_interval();
        let ping_interval = settings.ping_interval();
        let flush_delay = settings.queue_flush_delay();

        let mut flush_timer = interval_at(Instant::now() + flush_interval, flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let debounce = sleep(flush_delay);
        tokio::pin!(debounce);
        let mut debounce_armed = false;

        let result = loop {
            let paused = session.engine.is_paused();
            self.set_state(if paused {
                LoggerState::Backpressured
            } else {
                LoggerState::Streaming
            });

            tokio::select! {
                biased;
                _ = shutdown.as_mut() => break Ok(()),
                event = session.stream.next_event(), if !paused => {
                    let event = match event {
                        Ok(Some(event)) => event,
                        Ok(None) => {
                            break Err(Error::Connection("replication stream closed".to_string()));
                        }
                        Err(e) => break Err(e),
                    };
                    session.on_event(event);
                    if !debounce_armed && !session.engine.is_empty() {
                        debounce.as_mut().reset(Instant::now() + flush_delay);
                        debounce_armed = true;
                    }
                }
                _ = &mut debounce, if debounce_armed => {
                    debounce_armed = false;
                    if let Err(e) = session.flush().await {
                        break Err(e);
                    }
                }
                _ = flush_timer.tick() => {
                    if let Err(e) = session.flush().await {
                        break Err(e);
                    }
                }
                _ = ping_timer.tick() => {
                    if let Err(e) = session.ping().await {
                        break Err(e);
                    }
                }
            }
        };

        self.set_state(LoggerState::Ending);
        match result {
            Ok(()) => {
                session.end(true).await;
                Exit::Shutdown
            }
            Err(e) => {
                warn!(error = %e, "Streaming failed");
                session.end(false).await;
                Exit::Failed(e)
            }
        }
    }
}

async fn close_quietly<S: AuditStore>(store: &mut S) {
    if let Err(e) = store.close().await {
        debug!(error = %e, "Closing audit store failed");
    }
}

/// Connections and state of one streaming run.
struct Session<S, T> {
    store: S,
    stream: T,
    capture: CaptureEngine,
    engine: FlushEngine,
    cache: ShowCache,
    /// Checkpoint the stream was opened at; events up to it are replays.
    resume: Option<Checkpoint>,
}

impl<S: AuditStore, T: ChangeStream> Session<S, T> {
    fn on_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Rotate { file, position } => {
                if self.engine.position().is_some_and(|current| current.file == file) {
                    trace!(file = %file, "Rotate to current file ignored");
                    return;
                }
                info!(file = %file, position, "Rotate");
                self.engine.set_position(Checkpoint::new(file, position));
            }
            StreamEvent::TableMap {
                table_id,
                schema,
                table,
                next_position,
            } => {
                self.capture.on_table_map(table_id, &schema, &table);
                self.advance(next_position);
            }
            StreamEvent::Rows(rows) => {
                let Some(file) = self.engine.position().map(|current| current.file.clone()) else {
                    warn!(table_id = rows.table_id, "Rows event before any rotate, ignored");
                    return;
                };
                if self.is_replay(&file, rows.next_position) {
                    trace!(position = rows.next_position, "Replayed rows event skipped");
                    return;
                }

                let records = self.capture.on_rows(&rows);
                let checkpoint = Checkpoint::new(file, rows.next_position);
                if records.is_empty() {
                    self.engine.set_position(checkpoint);
                } else {
                    self.engine.enqueue(QueuedOperation { records, checkpoint });
                    debug!(queued = self.engine.len(), "Operation queued");
                }
            }
        }
    }

    fn is_replay(&self, file: &str, position: u64) -> bool {
        self.resume
            .as_ref()
            .is_some_and(|resume| resume.covers(file, position))
    }

    fn advance(&mut self, next_position: u64) {
        if let Some(file) = self.engine.position().map(|current| current.file.clone()) {
            if !self.is_replay(&file, next_position) {
                self.engine.set_position(Checkpoint::new(file, next_position));
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self.engine.flush(&mut self.store, &mut self.cache).await? {
            FlushOutcome::Applied { operations, batches } => {
                debug!(operations, batches, "Queue flushed");
            }
            FlushOutcome::Checkpointed(position) => {
                debug!(position = %position, "Position checkpointed");
            }
            FlushOutcome::Clean | FlushOutcome::Busy => {}
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        trace!("Sending pings");
        self.stream.ping().await?;
        self.store.ping().await
    }

    /// Tears the session down. `graceful` runs a last flush first.
    async fn end(mut self, graceful: bool) {
        info!("Ending session");
        if graceful {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Final flush failed");
            }
        }
        if let Err(e) = self.stream.kill().await {
            debug!(error = %e, "Killing stream failed");
        }
        close_quietly(&mut self.store).await;
        info!("Session ended");
    }
}
