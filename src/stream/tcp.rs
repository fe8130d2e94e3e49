//! JSON-lines client for an external binlog decoder.
//!
//! After connecting, the client writes a single `start` request. The decoder
//! then sends one JSON object per line: stream events (`rotate`, `table_map`,
//! `rows`), `pong` answers to `ping` requests, or an `error` before closing.
//! A ping sent while the previous one is still unanswered fails the health
//! check.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::{ChangeStream, StreamConnector, StreamEvent, StreamOptions};
use crate::checkpoint::Checkpoint;
use crate::{Error, Result};

/// Events buffered between the socket reader and the logger.
const EVENT_BUFFER: usize = 1024;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request<'a> {
    Start {
        server_id: u32,
        include: &'a BTreeMap<String, Vec<String>>,
        /// `null` starts at the current end.
        position: Option<&'a Checkpoint>,
    },
    Ping,
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    type Stream = TcpChangeStream;

    async fn connect(&self, options: &StreamOptions) -> Result<TcpChangeStream> {
        info!(address = %self.address, "Connecting to binlog decoder");

        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connecting to {}", self.address),
            })??;
        socket.set_nodelay(true)?;
        let (read_half, mut write_half) = socket.into_split();

        let start = Request::Start {
            server_id: options.server_id,
            include: &options.include,
            position: options.start.checkpoint(),
        };
        write_line(&mut write_half, &start).await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (pongs_tx, pongs) = watch::channel(0);
        let reader = tokio::spawn(read_events(read_half, tx, pongs_tx));

        info!(address = %self.address, start = ?options.start, "Binlog stream started");
        Ok(TcpChangeStream {
            writer: write_half,
            events: rx,
            reader,
            pings: 0,
            pongs,
        })
    }
}

pub struct TcpChangeStream {
    writer: OwnedWriteHalf,
    events: mpsc::Receiver<Result<StreamEvent>>,
    reader: JoinHandle<()>,
    pings: u64,
    /// Pongs received so far, counted by the reader.
    pongs: watch::Receiver<u64>,
}

#[async_trait]
impl ChangeStream for TcpChangeStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        self.events.recv().await.transpose()
    }

    async fn ping(&mut self) -> Result<()> {
        let pongs = *self.pongs.borrow();
        if pongs < self.pings {
            return Err(Error::Timeout {
                message: format!("binlog decoder did not answer ping {}", self.pings),
            });
        }
        write_line(&mut self.writer, &Request::Ping).await?;
        self.pings += 1;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.reader.abort();
        self.events.close();
        self.writer.shutdown().await?;
        debug!("Binlog stream killed");
        Ok(())
    }
}

impl Drop for TcpChangeStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, request: &Request<'_>) -> Result<()> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_events(
    read_half: OwnedReadHalf,
    tx: mpsc::Sender<Result<StreamEvent>>,
    pongs: watch::Sender<u64>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let item = match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match parse_line(&line) {
                Ok(Incoming::Event(event)) => Ok(event),
                Ok(Incoming::Pong) => {
                    trace!("Binlog decoder pong");
                    pongs.send_modify(|count| *count += 1);
                    continue;
                }
                Err(e) => Err(e),
            },
            Ok(None) => Err(Error::Connection(
                "binlog decoder closed the connection".to_string(),
            )),
            Err(e) => Err(Error::Io(e)),
        };

        let last = item.is_err();
        if tx.send(item).await.is_err() {
            return;
        }
        if last {
            error!("Binlog stream reader stopped");
            return;
        }
    }
}

#[derive(Debug, PartialEq)]
enum Incoming {
    Event(StreamEvent),
    Pong,
}

fn parse_line(line: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(line)?;
    match value.get("type").and_then(Value::as_str) {
        Some("pong") => Ok(Incoming::Pong),
        Some("error") => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(Error::Stream(message.to_string()))
        }
        Some(_) => Ok(Incoming::Event(serde_json::from_value(value)?)),
        None => Err(Error::InvalidMessage {
            message: format!("missing message type: {}", line),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StartPosition;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line(r#"{"type":"pong"}"#).unwrap(), Incoming::Pong);
        assert_eq!(
            parse_line(r#"{"type":"rotate","file":"bin.000002","position":4}"#).unwrap(),
            Incoming::Event(StreamEvent::Rotate {
                file: "bin.000002".to_string(),
                position: 4
            })
        );
        assert!(matches!(
            parse_line(r#"{"type":"error","message":"purged"}"#),
            Err(Error::Stream(message)) if message == "purged"
        ));
        assert!(matches!(parse_line(r#"{"file":"x"}"#), Err(Error::InvalidMessage { .. })));
    }

    #[tokio::test]
    async fn test_start_request_and_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let start = lines.next_line().await.unwrap().unwrap();
            let start: Value = serde_json::from_str(&start).unwrap();

            write_half
                .write_all(b"{\"type\":\"rotate\",\"file\":\"bin.000009\",\"position\":4}\n")
                .await
                .unwrap();
            let ping = lines.next_line().await.unwrap().unwrap();
            write_half.write_all(b"{\"type\":\"pong\"}\n").await.unwrap();
            (start, ping)
        });

        let connector = TcpConnector::new(address, Duration::from_secs(5));
        let options = StreamOptions {
            include: BTreeMap::from([("shop".to_string(), vec!["order".to_string()])]),
            start: StartPosition::At(Checkpoint::new("bin.000009", 120)),
            server_id: 3,
        };
        let mut stream = connector.connect(&options).await.unwrap();

        assert_eq!(
            stream.next_event().await.unwrap(),
            Some(StreamEvent::Rotate {
                file: "bin.000009".to_string(),
                position: 4
            })
        );
        stream.ping().await.unwrap();

        let (start, ping) = server.await.unwrap();
        assert_eq!(start["type"], "start");
        assert_eq!(start["server_id"], 3);
        assert_eq!(start["include"]["shop"][0], "order");
        assert_eq!(start["position"]["file"], "bin.000009");
        assert_eq!(start["position"]["position"], 120);
        assert_eq!(ping, r#"{"type":"ping"}"#);

        // server dropped the socket
        let err = stream.next_event().await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_kill_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let connector = TcpConnector::new(address, Duration::from_secs(5));
        let options = StreamOptions {
            include: BTreeMap::new(),
            start: StartPosition::End,
            server_id: 1,
        };
        let mut stream = connector.connect(&options).await.unwrap();
        stream.kill().await.unwrap();

        let received = server.await.unwrap();
        let start: Value = serde_json::from_slice(&received[..received.len() - 1]).unwrap();
        assert_eq!(start["position"], Value::Null);
    }

    #[tokio::test]
    async fn test_unanswered_ping_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap();
            let ping = lines.next_line().await.unwrap().unwrap();
            // keep the socket open without answering
            let _ = done_rx.await;
            ping
        });

        let connector = TcpConnector::new(address, Duration::from_secs(5));
        let options = StreamOptions {
            include: BTreeMap::new(),
            start: StartPosition::End,
            server_id: 1,
        };
        let mut stream = connector.connect(&options).await.unwrap();

        stream.ping().await.unwrap();
        let err = stream.ping().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_connection_lost());

        done_tx.send(()).unwrap();
        assert_eq!(server.await.unwrap(), r#"{"type":"ping"}"#);
    }

    #[tokio::test]
    async fn test_answered_pings_keep_passing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            lines.next_line().await.unwrap();
            while let Ok(Some(_)) = lines.next_line().await {
                write_half.write_all(b"{\"type\":\"pong\"}\n").await.unwrap();
            }
        });

        let connector = TcpConnector::new(address, Duration::from_secs(5));
        let options = StreamOptions {
            include: BTreeMap::new(),
            start: StartPosition::End,
            server_id: 1,
        };
        let mut stream = connector.connect(&options).await.unwrap();

        for _ in 0..3 {
            stream.ping().await.unwrap();
            let mut pongs = stream.pongs.clone();
            let answered = stream.pings;
            tokio::time::timeout(Duration::from_secs(5), pongs.wait_for(|n| *n >= answered))
                .await
                .unwrap()
                .unwrap();
        }

        stream.kill().await.unwrap();
        server.await.unwrap();
    }
}
