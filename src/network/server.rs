//! Dawn relay server
//!
//! The server accepts connections and runs an independent session for
//! each one. Sessions share only the read-only handler registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_native_tls::{native_tls, TlsAcceptor};
use uuid::Uuid;

use super::session::{CloseReason, Session, SessionHandle};
use super::NetworkConfig;
use crate::handler::HandlerRegistry;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Pause after a failed accept so fd exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// A connection was accepted and its session started
    SessionOpened { id: Uuid, addr: SocketAddr },
    /// A session finished
    SessionClosed {
        id: Uuid,
        addr: SocketAddr,
        reason: CloseReason,
    },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// Dawn relay server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Handlers shared by every session
    registry: Arc<HandlerRegistry>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal, observed by the accept loop and every session
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Accept loop task
    accept_task: Option<JoinHandle<()>>,
    /// Bound address once started
    local_addr: Option<SocketAddr>,
    /// Number of live sessions
    active_sessions: Arc<AtomicUsize>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server. The registry is frozen from here on.
    pub fn new(config: NetworkConfig, registry: HandlerRegistry) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            registry: Arc::new(registry),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start the server, returning the bound address.
    ///
    /// Bind and TLS setup failures are returned here rather than logged.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let tls = if self.config.use_tls {
            Some(load_tls_acceptor(&self.config).await?)
        } else {
            None
        };

        let bind_addr = self.config.listen_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!(tls = tls.is_some(), "Server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let accept_loop = AcceptLoop {
            listener,
            tls,
            config: self.config.clone(),
            registry: self.registry.clone(),
            event_tx: self.event_tx.clone(),
            shutdown_rx,
            active_sessions: self.active_sessions.clone(),
            running: self.running.clone(),
        };
        self.accept_task = Some(tokio::spawn(accept_loop.run()));

        Ok(local_addr)
    }

    /// Stop the server.
    ///
    /// Signals every session to close, waits up to the configured shutdown
    /// timeout for them, aborts whatever is left and releases the listener.
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop failed: {}", e);
            }
        }

        self.local_addr = None;
        Ok(())
    }

    /// Address the server is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of sessions currently running
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Get the handler registry
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Publish an event without ever waiting on the consumer
fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = event_tx.try_send(event) {
        tracing::debug!("Event channel full, dropping {:?}", event);
    }
}

/// Build a TLS acceptor from a PEM certificate chain and PKCS#8 PEM key
async fn load_tls_acceptor(config: &NetworkConfig) -> ServerResult<TlsAcceptor> {
    let (cert_path, key_path) = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(ServerError::Tls(
                "TLS enabled but certificate or key path missing".to_string(),
            ))
        }
    };

    let cert = tokio::fs::read(cert_path).await.map_err(|e| {
        ServerError::Tls(format!("Failed to read {}: {}", cert_path.display(), e))
    })?;
    let key = tokio::fs::read(key_path).await.map_err(|e| {
        ServerError::Tls(format!("Failed to read {}: {}", key_path.display(), e))
    })?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let acceptor =
        native_tls::TlsAcceptor::new(identity).map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(acceptor))
}

/// Decrements the live session count when a session task ends or is aborted
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum AcceptEvent {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Finished(Result<(), JoinError>),
    Shutdown,
}

struct AcceptLoop {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    config: NetworkConfig,
    registry: Arc<HandlerRegistry>,
    event_tx: mpsc::Sender<ServerEvent>,
    shutdown_rx: watch::Receiver<bool>,
    active_sessions: Arc<AtomicUsize>,
    running: Arc<RwLock<bool>>,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut sessions = JoinSet::new();
        let mut live: Vec<SessionHandle> = Vec::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown_rx.wait_for(|stop| *stop) => AcceptEvent::Shutdown,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    AcceptEvent::Finished(joined)
                }
                result = self.listener.accept() => AcceptEvent::Accepted(result),
            };

            match event {
                AcceptEvent::Accepted(Ok((stream, addr))) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %addr, "Failed to set TCP_NODELAY: {}", e);
                    }
                    let handle = SessionHandle::new(Uuid::new_v4(), addr);
                    sessions.spawn(self.session_task(stream, handle.clone()));
                    live.push(handle);
                }
                AcceptEvent::Accepted(Err(e)) => self.accept_failed(e).await,
                AcceptEvent::Finished(joined) => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Session task panicked: {}", e);
                        }
                    }
                    live.retain(SessionHandle::is_alive);
                }
                AcceptEvent::Shutdown => {
                    tracing::info!(sessions = sessions.len(), "Server shutdown requested");
                    break;
                }
            }
        }

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("Session task failed during shutdown: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.len(),
                "Sessions did not close within {:?}, abandoning them",
                timeout
            );
            for handle in live.iter().filter(|h| h.is_alive()) {
                tracing::warn!(
                    session = %handle.id(),
                    peer = %handle.remote_addr(),
                    "Aborting session"
                );
            }
            sessions.shutdown().await;
        }

        drop(self.listener);

        {
            let mut running = self.running.write().await;
            *running = false;
        }

        emit(&self.event_tx, ServerEvent::Stopped);
        tracing::info!("Server stopped");
    }

    async fn accept_failed(&self, e: std::io::Error) {
        tracing::error!("Accept error: {}", e);
        emit(&self.event_tx, ServerEvent::Error { message: e.to_string() });
        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
    }

    fn session_task(
        &self,
        stream: TcpStream,
        handle: SessionHandle,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let id = handle.id();
        let addr = handle.remote_addr();
        let guard = ActiveGuard::new(self.active_sessions.clone());
        let tls = self.tls.clone();
        let config = self.config.clone();
        let registry = self.registry.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let event_tx = self.event_tx.clone();

        async move {
            let _guard = guard;
            emit(&event_tx, ServerEvent::SessionOpened { id, addr });

            let reason = match tls {
                Some(acceptor) => {
                    let handshake = Duration::from_millis(config.connect_timeout_ms);
                    match tokio::time::timeout(handshake, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => {
                            Session::new(tls_stream, addr, registry, &config)
                                .with_handle(handle.clone())
                                .with_shutdown(shutdown_rx)
                                .run()
                                .await
                        }
                        Ok(Err(e)) => {
                            CloseReason::Transport(format!("TLS handshake failed: {}", e))
                        }
                        Err(_) => CloseReason::Transport("TLS handshake timed out".to_string()),
                    }
                }
                None => {
                    Session::new(stream, addr, registry, &config)
                        .with_handle(handle.clone())
                        .with_shutdown(shutdown_rx)
                        .run()
                        .await
                }
            };
            // A failed handshake never built a session
            handle.mark_closing();

            emit(&event_tx, ServerEvent::SessionClosed { id, addr, reason });
        }
    }
}
