//! Connection handling for the relay
//!
//! Wraps one byte stream with:
//! - Frame encoding/decoding
//! - Read buffering across partial frames
//! - Per-connection statistics

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::Transport;
use crate::protocol::{CodecError, Frame, FrameCodec, LENGTH_PREFIX_SIZE};

/// Size of a single read from the transport
const READ_CHUNK_SIZE: usize = 4096;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed mid-frame ({0} bytes buffered)")]
    Truncated(usize),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A framed connection to a remote peer
pub struct Connection<S> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The underlying stream
    stream: S,
    /// Frame codec
    codec: FrameCodec,
    /// Read buffer
    read_buf: BytesMut,
    /// Write buffer
    write_buf: BytesMut,
    /// Set once the stream has been shut down
    closed: bool,
    /// Last activity timestamp
    last_activity: Instant,
    /// Statistics
    stats: ConnectionStats,
}

impl<S: Transport> Connection<S> {
    /// Create a new connection from an established stream
    pub fn new(stream: S, remote_addr: SocketAddr, max_payload_size: usize) -> Self {
        Self {
            remote_addr,
            stream,
            codec: FrameCodec::new(max_payload_size),
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            write_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            closed: false,
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send a single frame
    pub async fn send(&mut self, frame: &Frame) -> ConnectionResult<()> {
        self.send_all(std::slice::from_ref(frame)).await
    }

    /// Send frames in order with a single flush at the end
    pub async fn send_all(&mut self, frames: &[Frame]) -> ConnectionResult<()> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        if frames.is_empty() {
            return Ok(());
        }

        self.write_buf.clear();
        for frame in frames {
            self.codec.encode(frame, &mut self.write_buf)?;
        }

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.frames_sent += frames.len() as u64;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        self.last_activity = Instant::now();

        Ok(())
    }

    /// Receive the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly between frames. Safe to
    /// cancel: bytes already read stay buffered for the next call.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }

        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                self.stats.frames_received += 1;
                self.last_activity = Instant::now();
                return Ok(Some(frame));
            }

            self.read_buf.reserve(READ_CHUNK_SIZE);
            let n = self.stream.read_buf(&mut self.read_buf).await?;

            if n == 0 {
                if !self.codec.is_mid_frame() && self.read_buf.is_empty() {
                    return Ok(None); // Clean close
                }
                return Err(ConnectionError::Truncated(self.partial_frame_len()));
            }

            self.stats.bytes_received += n as u64;
        }
    }

    /// Bytes of the unfinished frame, counting a header the codec already consumed
    fn partial_frame_len(&self) -> usize {
        if self.codec.is_mid_frame() {
            LENGTH_PREFIX_SIZE + self.read_buf.len()
        } else {
            self.read_buf.len()
        }
    }

    /// Try to receive a frame with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Frame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Flush anything pending and shut the stream down
    pub async fn close(&mut self) -> ConnectionResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.stream.flush().await?;
        self.stream.shutdown().await?;

        Ok(())
    }

    /// Get the underlying stream for advanced operations
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Check if the connection has been closed locally
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Get time since last activity
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}
