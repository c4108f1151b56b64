//! Per-connection session
//!
//! A session greets the peer, then repeatedly reads one frame, dispatches it
//! through the handler registry and writes every response before reading the
//! next frame. Sessions share nothing but the read-only registry.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use super::connection::{Connection, ConnectionError};
use super::{NetworkConfig, Transport};
use crate::handler::{Dispatch, HandlerRegistry};
use crate::protocol::{CodecError, Frame};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Sending the greeting frame
    Greeting,
    /// Receiving and dispatching frames
    Active,
    /// Flushing and releasing the transport
    Closing,
    /// Terminal, no further I/O
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream between frames
    PeerClosed,
    /// No frame arrived within the idle timeout
    IdleTimeout,
    /// Server is shutting down
    Shutdown,
    /// Declared frame length over the configured maximum
    FrameTooLarge { declared: usize, max: usize },
    /// Undecodable bytes on the wire
    Corrupt(String),
    /// Unknown tag under strict validation
    MalformedTag(u8),
    /// A handler could not process a frame
    HandlerFailure { tag: u8, reason: String },
    /// Read or write failed
    Transport(String),
}

impl CloseReason {
    /// Whether the session ended because something went wrong
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            CloseReason::PeerClosed | CloseReason::IdleTimeout | CloseReason::Shutdown
        )
    }

    fn from_connection_error(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Timeout => CloseReason::IdleTimeout,
            ConnectionError::Protocol(CodecError::FrameTooLarge(declared, max)) => {
                CloseReason::FrameTooLarge { declared, max }
            }
            ConnectionError::Protocol(CodecError::Io(e)) | ConnectionError::Io(e) => {
                CloseReason::Transport(e.to_string())
            }
            ConnectionError::Protocol(e) => CloseReason::Corrupt(e.to_string()),
            e @ (ConnectionError::Truncated(_) | ConnectionError::Closed) => {
                CloseReason::Transport(e.to_string())
            }
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed connection"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Shutdown => write!(f, "server shutting down"),
            CloseReason::FrameTooLarge { declared, max } => {
                write!(f, "frame too large: {} bytes (max: {})", declared, max)
            }
            CloseReason::Corrupt(e) => write!(f, "corrupt frame: {}", e),
            CloseReason::MalformedTag(tag) => write!(f, "unknown tag {}", tag),
            CloseReason::HandlerFailure { tag, reason } => {
                write!(f, "handler for tag {} failed: {}", tag, reason)
            }
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Observes a session from outside the task running it
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    remote_addr: SocketAddr,
    alive: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(id: Uuid, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// False once the session has started closing
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closing(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// One live client connection
pub struct Session<S> {
    handle: SessionHandle,
    conn: Connection<S>,
    registry: Arc<HandlerRegistry>,
    state: SessionState,
    greeting: Frame,
    idle_timeout: Option<Duration>,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl<S: Transport> Session<S> {
    pub fn new(
        stream: S,
        remote_addr: SocketAddr,
        registry: Arc<HandlerRegistry>,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            handle: SessionHandle::new(Uuid::new_v4(), remote_addr),
            conn: Connection::new(stream, remote_addr, config.max_payload_size),
            registry,
            state: SessionState::Greeting,
            greeting: Frame::greeting(config.greeting.clone()),
            idle_timeout: config.idle_timeout,
            shutdown_rx: None,
        }
    }

    /// Close the session when `true` is published on this channel or the
    /// sender is dropped
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Report liveness through an existing handle, taking over its id
    pub fn with_handle(mut self, handle: SessionHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn id(&self) -> Uuid {
        self.handle.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// A handle that keeps reporting liveness after `run` takes the session
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Whether the session can still do I/O
    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    /// Drive the session to completion
    pub async fn run(mut self) -> CloseReason {
        let peer = self.conn.remote_addr();
        let id = self.id();
        tracing::info!(session = %id, %peer, "Session opened");

        let reason = match self.greet().await {
            Ok(()) => self.serve().await,
            Err(e) => CloseReason::from_connection_error(e),
        };

        self.transition(SessionState::Closing);
        if let Err(e) = self.conn.close().await {
            tracing::debug!(session = %id, %peer, "Close failed: {}", e);
        }
        self.transition(SessionState::Closed);

        let stats = self.conn.stats();
        if reason.is_error() {
            tracing::warn!(
                session = %id,
                %peer,
                frames_in = stats.frames_received,
                frames_out = stats.frames_sent,
                "Session closed: {}",
                reason
            );
        } else {
            tracing::info!(
                session = %id,
                %peer,
                frames_in = stats.frames_received,
                frames_out = stats.frames_sent,
                "Session closed: {}",
                reason
            );
        }

        reason
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!(session = %self.handle.id, from = ?self.state, to = ?next, "State change");
        if next == SessionState::Closing {
            self.handle.mark_closing();
        }
        self.state = next;
    }

    async fn greet(&mut self) -> Result<(), ConnectionError> {
        self.conn.send(&self.greeting).await?;
        self.transition(SessionState::Active);
        Ok(())
    }

    async fn serve(&mut self) -> CloseReason {
        loop {
            let received = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown_rx) => return CloseReason::Shutdown,
                result = recv_next(&mut self.conn, self.idle_timeout) => result,
            };

            let frame = match received {
                Ok(Some(frame)) => frame,
                Ok(None) => return CloseReason::PeerClosed,
                Err(e) => return CloseReason::from_connection_error(e),
            };

            let id = self.handle.id;
            let tag = frame.tag();
            tracing::debug!(session = %id, tag, len = frame.payload().len(), "Frame received");

            let responses = match self.registry.dispatch(tag) {
                Dispatch::Handler(handler) => match handler.handle(frame).await {
                    Ok(responses) => responses,
                    Err(e) => {
                        tracing::error!(session = %id, tag, "Handler failed: {}", e);
                        return CloseReason::HandlerFailure {
                            tag,
                            reason: e.to_string(),
                        };
                    }
                },
                Dispatch::Echo => vec![frame],
                Dispatch::Reject => return CloseReason::MalformedTag(tag),
            };

            match self.conn.send_all(&responses).await {
                Ok(()) => {}
                // Our own response broke the limit, not the peer's frame
                Err(ConnectionError::Protocol(CodecError::FrameTooLarge(size, max))) => {
                    tracing::error!(session = %id, tag, size, max, "Handler response too large");
                    return CloseReason::HandlerFailure {
                        tag,
                        reason: format!("response payload of {} bytes exceeds max {}", size, max),
                    };
                }
                Err(e) => return CloseReason::from_connection_error(e),
            }
        }
    }
}

async fn recv_next<S: Transport>(
    conn: &mut Connection<S>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Frame>, ConnectionError> {
    match idle_timeout {
        Some(timeout) => conn.recv_timeout(timeout).await,
        None => conn.recv().await,
    }
}

/// Resolves once shutdown is requested; pends forever without a channel
async fn wait_for_shutdown(shutdown_rx: &mut Option<watch::Receiver<bool>>) {
    match shutdown_rx {
        Some(rx) => {
            // A dropped sender also means shutdown
            let _ = rx.wait_for(|stop| *stop).await;
        }
        None => std::future::pending().await,
    }
}
