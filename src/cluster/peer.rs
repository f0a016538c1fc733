//! One live connection to a remote cluster node
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::NodeName;
use super::packet::Packet;
use super::stream::{PeerReader, PeerWriter};
use crate::error::{Result, SkeinError};
use crate::settings::MAX_FRAME_SIZE;

/// Which side dialed the connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Configured, no connection yet
    #[default]
    Offline,
    Authenticating,
    /// The remote announced it is shutting down
    Stopping,
    Online,
    Leaving,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            NodeStatus::Offline => "Offline",
            NodeStatus::Authenticating => "Authenticating",
            NodeStatus::Stopping => "Stopping",
            NodeStatus::Online => "Online",
            NodeStatus::Leaving => "Leaving",
        };
        f.pad(status)
    }
}

/// Liveness metrics of a connection; start fresh with every new connection
#[derive(Clone, Debug)]
pub struct PeerMetrics {
    /// Approximate one-way latency from the last ping. Includes clock skew
    /// between the two hosts and may be negative.
    pub lag: chrono::Duration,
    pub packets: u64,
    pub status: NodeStatus,
    pub error: Option<String>,
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self {
            lag: chrono::Duration::zero(),
            packets: 0,
            status: NodeStatus::Offline,
            error: None,
        }
    }
}

/// An authorized connection to a named peer.
///
/// The read half is not stored here: it belongs to the task running the
/// read loop. Writes go through a per-socket mutex so frames from the
/// keepalive task and the dispatcher never interleave. The writer is taken
/// out on shutdown; writing afterwards fails with `Closed`.
#[derive(Debug)]
pub struct Peer {
    name: NodeName,
    direction: Direction,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    join_time: DateTime<Utc>,
    writer: tokio::sync::Mutex<Option<PeerWriter>>,
    write_timeout: Duration,
    metrics: Mutex<PeerMetrics>,
    cancel: CancellationToken,
}

impl Peer {
    pub fn new(
        name: NodeName,
        direction: Direction,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        writer: PeerWriter,
        write_timeout: Duration,
    ) -> Self {
        Self {
            name,
            direction,
            local_addr,
            remote_addr,
            join_time: Utc::now(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            write_timeout,
            metrics: Mutex::new(PeerMetrics::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn join_time(&self) -> DateTime<Utc> {
        self.join_time
    }

    pub fn metrics(&self) -> PeerMetrics {
        self.metrics.lock().clone()
    }

    pub fn set_lag(&self, lag: chrono::Duration) {
        self.metrics.lock().lag = lag;
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.metrics.lock().status = status;
    }

    pub fn set_error(&self, error: Option<String>) {
        self.metrics.lock().error = error;
    }

    pub fn increment_packet_count(&self) {
        self.metrics.lock().packets += 1;
    }

    /// Write one complete frame.
    ///
    /// Bounded by the write timeout and abandoned as soon as the connection
    /// is closed. Any failure closes the connection: a partially written
    /// frame leaves the stream unusable.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SkeinError::Closed(format!(
                "connection to {} is closing",
                self.name
            ))),
            written = timeout(self.write_timeout, self.write_locked(frame)) => match written {
                Ok(result) => result,
                Err(_) => Err(SkeinError::Write(format!(
                    "{} ({}): write timed out after {:?}",
                    self.name, self.remote_addr, self.write_timeout
                ))),
            },
        };
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn write_locked(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| SkeinError::Closed(format!("connection to {} is shut down", self.name)))?;
        let map_err = |e: std::io::Error| {
            SkeinError::Write(format!("{} ({}): {}", self.name, self.remote_addr, e))
        };
        writer.write_all(frame).await.map_err(map_err)?;
        writer.flush().await.map_err(map_err)
    }

    /// Signal teardown. Safe to call any number of times; only the first
    /// call has an effect.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is being torn down
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Shut down and drop the write side so the remote sees EOF right away.
    /// Gives up after the write timeout if the remote stopped reading.
    pub async fn shutdown_writer(&self) {
        let writer = match timeout(self.write_timeout, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => return,
        };
        if let Some(mut writer) = writer {
            let _ = timeout(self.write_timeout, writer.shutdown()).await;
        }
    }
}

/// Buffered frame reader over the read half of a peer socket
#[derive(Debug)]
pub struct FrameReader {
    inner: BufReader<PeerReader>,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(read_half: PeerReader) -> Self {
        Self {
            inner: BufReader::new(read_half),
            buf: Vec::with_capacity(1024),
        }
    }

    /// Read the next frame, waiting at most `read_timeout` for it
    pub async fn read_packet(&mut self, read_timeout: Duration) -> Result<Packet> {
        self.buf.clear();
        let limit = (MAX_FRAME_SIZE + 1) as u64;
        let mut limited = (&mut self.inner).take(limit);
        let read = timeout(read_timeout, limited.read_until(b'\n', &mut self.buf))
            .await
            .map_err(|_| SkeinError::ReadTimeout(read_timeout))??;

        if read == 0 {
            return Err(SkeinError::Closed("connection closed by remote".to_string()));
        }
        if self.buf.last() != Some(&b'\n') {
            if self.buf.len() > MAX_FRAME_SIZE {
                return Err(SkeinError::MalformedFrame(format!(
                    "frame exceeds {} bytes",
                    MAX_FRAME_SIZE
                )));
            }
            return Err(SkeinError::Closed(
                "connection closed in the middle of a frame".to_string(),
            ));
        }
        Packet::unpack(&self.buf)
    }
}
