//! Network module - Handles TCP/TLS transport for the relay
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Session running one connection's receive/dispatch/send loop
//! - Client for connecting to a server
//! - Connection framing on top of any byte stream

mod client;
mod connection;
mod server;
mod session;

pub use client::*;
pub use connection::*;
pub use server::*;
pub use session::*;

use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::{
    DEFAULT_BIND_ADDRESS, DEFAULT_GREETING, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT,
};

/// Byte stream a connection can run over
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface to listen on
    pub bind_address: String,
    /// Port to listen on or connect to
    pub port: u16,
    /// Whether to use TLS encryption
    pub use_tls: bool,
    /// Path to TLS certificate, PEM (for server)
    pub cert_path: Option<PathBuf>,
    /// Path to TLS private key, PKCS#8 PEM (for server)
    pub key_path: Option<PathBuf>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Close a session after this long without a frame
    pub idle_timeout: Option<Duration>,
    /// How long `stop` waits for sessions to finish
    pub shutdown_timeout_ms: u64,
    /// Maximum payload size of a single frame
    pub max_payload_size: usize,
    /// Payload of the greeting frame
    pub greeting: Bytes,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            use_tls: false,
            cert_path: None,
            key_path: None,
            connect_timeout_ms: 5000,
            idle_timeout: None,
            shutdown_timeout_ms: 5000,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            greeting: Bytes::from_static(DEFAULT_GREETING),
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_tls(mut self, cert_path: PathBuf, key_path: PathBuf) -> Self {
        self.use_tls = true;
        self.cert_path = Some(cert_path);
        self.key_path = Some(key_path);
        self
    }

    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn with_shutdown_timeout_ms(mut self, shutdown_timeout_ms: u64) -> Self {
        self.shutdown_timeout_ms = shutdown_timeout_ms;
        self
    }

    pub fn with_greeting(mut self, greeting: impl Into<Bytes>) -> Self {
        self.greeting = greeting.into();
        self
    }

    /// Address string the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
