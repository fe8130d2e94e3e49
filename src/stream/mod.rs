//! Replication stream boundary.
//!
//! The binary protocol decoder lives outside this crate; the logger only sees
//! decoded [`StreamEvent`]s through a [`ChangeStream`] opened by a
//! [`StreamConnector`].

pub mod channel;
pub mod tcp;
pub mod types;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::Result;

pub use channel::{ChannelConnector, ChannelStream, StreamFeeder};
pub use tcp::{TcpChangeStream, TcpConnector};
pub use types::{row, Action, ColumnValue, Row, RowChange, RowsEvent, StreamEvent};

/// Where a newly opened stream starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// Resume right after a persisted checkpoint.
    At(Checkpoint),
    /// Start at the current end, skipping history.
    End,
}

impl StartPosition {
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            StartPosition::At(checkpoint) => Some(checkpoint),
            StartPosition::End => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Tables to deliver, `schema -> [table]`.
    pub include: BTreeMap<String, Vec<String>>,
    pub start: StartPosition,
    pub server_id: u32,
}

/// An open replication stream.
#[async_trait]
pub trait ChangeStream: Send {
    /// Next event in stream order, `None` once the source closed the stream.
    ///
    /// Must be cancel-safe: dropping the future loses no event.
    async fn next_event(&mut self) -> Result<Option<StreamEvent>>;

    /// Health check of the control channel.
    async fn ping(&mut self) -> Result<()>;

    /// Terminates the data connection, then the control channel.
    async fn kill(&mut self) -> Result<()>;
}

/// Opens replication streams.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    type Stream: ChangeStream;

    async fn connect(&self, options: &StreamOptions) -> Result<Self::Stream>;
}
