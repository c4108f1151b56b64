//! Dawn relay client
//!
//! Connects to a relay server, consumes the greeting and exchanges frames.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

use super::connection::{Connection, ConnectionError};
use super::NetworkConfig;
use crate::protocol::{tags, Frame};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Connection timeout")]
    Timeout,

    #[error("Server closed the connection")]
    Closed,

    #[error("Expected greeting frame, got tag {0}")]
    UnexpectedGreeting(u8),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Dawn relay client
pub struct Client {
    conn: Connection<TcpStream>,
    greeting: Frame,
    timeout: Duration,
}

impl Client {
    /// Connect to a server and wait for its greeting
    pub async fn connect(server_addr: SocketAddr, config: &NetworkConfig) -> ClientResult<Self> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);

        tracing::info!("Connecting to {}", server_addr);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(server_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout),
        };
        stream.set_nodelay(true)?;

        let mut conn = Connection::new(stream, server_addr, config.max_payload_size);

        let greeting = match conn.recv_timeout(timeout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(ClientError::Closed),
            Err(ConnectionError::Timeout) => return Err(ClientError::Timeout),
            Err(e) => return Err(ClientError::Connection(e)),
        };
        if greeting.tag() != tags::HANDSHAKE {
            return Err(ClientError::UnexpectedGreeting(greeting.tag()));
        }

        tracing::debug!("Greeting from {}: {}", server_addr, greeting.summary());

        Ok(Self {
            conn,
            greeting,
            timeout,
        })
    }

    /// Connect, retrying after `delay` until `attempts` connects have failed
    pub async fn connect_with_retry(
        server_addr: SocketAddr,
        config: &NetworkConfig,
        attempts: u32,
        delay: Duration,
    ) -> ClientResult<Self> {
        let mut attempt = 1;
        loop {
            match Self::connect(server_addr, config).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt < attempts => {
                    tracing::warn!(attempt, "Connect to {} failed: {}, retrying", server_addr, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(hostname: &str, config: &NetworkConfig) -> ClientResult<Self> {
        let addr = super::resolve_host(hostname, config.port).await?;
        Self::connect(addr, config).await
    }

    /// The greeting frame the server sent on connect
    pub fn greeting(&self) -> &Frame {
        &self.greeting
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// Send a frame to the server
    pub async fn send(&mut self, frame: &Frame) -> ClientResult<()> {
        self.conn.send(frame).await?;
        Ok(())
    }

    /// Receive the next frame, `None` once the server has closed
    pub async fn recv(&mut self) -> ClientResult<Option<Frame>> {
        match self.conn.recv_timeout(self.timeout).await {
            Ok(frame) => Ok(frame),
            Err(ConnectionError::Timeout) => Err(ClientError::Timeout),
            Err(e) => Err(ClientError::Connection(e)),
        }
    }

    /// Send a frame and wait for exactly one response
    pub async fn request(&mut self, frame: &Frame) -> ClientResult<Frame> {
        self.send(frame).await?;
        self.recv().await?.ok_or(ClientError::Closed)
    }

    /// Close the connection
    pub async fn disconnect(mut self) -> ClientResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}
