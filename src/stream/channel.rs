//! In-process stream source.
//!
//! [`channel`] returns a connector for the logger and a [`StreamFeeder`] for
//! whoever produces the events. Every `connect` opens a fresh session; events
//! fed while no session is open are dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{ChangeStream, StreamConnector, StreamEvent, StreamOptions};
use crate::{Error, Result};

type Item = Result<StreamEvent>;

struct Shared {
    session: Mutex<Option<mpsc::UnboundedSender<Item>>>,
    options: Mutex<Vec<StreamOptions>>,
    connects: watch::Sender<usize>,
    failing_connects: AtomicUsize,
    failing_pings: AtomicBool,
    kills: AtomicUsize,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Item>>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn options(&self) -> MutexGuard<'_, Vec<StreamOptions>> {
        self.options.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Creates a connected connector/feeder pair.
pub fn channel() -> (ChannelConnector, StreamFeeder) {
    let (connects, _) = watch::channel(0);
    let shared = Arc::new(Shared {
        session: Mutex::new(None),
        options: Mutex::new(Vec::new()),
        connects,
        failing_connects: AtomicUsize::new(0),
        failing_pings: AtomicBool::new(false),
        kills: AtomicUsize::new(0),
    });
    (
        ChannelConnector {
            shared: shared.clone(),
        },
        StreamFeeder { shared },
    )
}

#[derive(Clone)]
pub struct ChannelConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl StreamConnector for ChannelConnector {
    type Stream = ChannelStream;

    async fn connect(&self, options: &StreamOptions) -> Result<ChannelStream> {
        let shared = &self.shared;
        let failing = shared.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            shared.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Connection("stream source unavailable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *shared.session() = Some(tx);
        shared.options().push(options.clone());
        shared.connects.send_modify(|count| *count += 1);
        debug!(start = ?options.start, "Channel stream opened");

        Ok(ChannelStream {
            events: rx,
            shared: shared.clone(),
        })
    }
}

pub struct ChannelStream {
    events: mpsc::UnboundedReceiver<Item>,
    shared: Arc<Shared>,
}

#[async_trait]
impl ChangeStream for ChannelStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        self.events.recv().await.transpose()
    }

    async fn ping(&mut self) -> Result<()> {
        if self.shared.failing_pings.load(Ordering::SeqCst) {
            return Err(Error::Connection("stream ping failed".to_string()));
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.events.close();
        self.shared.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Producer side of [`channel`].
#[derive(Clone)]
pub struct StreamFeeder {
    shared: Arc<Shared>,
}

impl StreamFeeder {
    /// Delivers `event` to the open session. Returns `false` when there is none.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.push(Ok(event))
    }

    /// Makes the open session fail with `error`.
    pub fn fail(&self, error: Error) -> bool {
        self.push(Err(error))
    }

    /// Closes the open session as if the source hung up.
    pub fn disconnect(&self) {
        self.shared.session().take();
    }

    /// Fails the next `count` connection attempts with a connection error.
    pub fn fail_next_connects(&self, count: usize) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, failing: bool) {
        self.shared.failing_pings.store(failing, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        *self.shared.connects.borrow()
    }

    pub fn kills(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }

    /// Options of every successful connect, oldest first.
    pub fn options(&self) -> Vec<StreamOptions> {
        self.shared.options().clone()
    }

    /// Waits until at least `count` sessions have been opened.
    pub async fn wait_for_connects(&self, count: usize) {
        let mut connects = self.shared.connects.subscribe();
        // the sender lives in `shared`, so this only fails if we outlive it
        let _ = connects.wait_for(|connected| *connected >= count).await;
    }

    fn push(&self, item: Item) -> bool {
        match self.shared.session().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}
