//! Handler module - Pluggable per-tag frame processing
//!
//! Provides:
//! - The [`Handler`] trait every frame processor implements
//! - [`EchoHandler`], the fallback for tags with nothing registered
//! - [`HandlerRegistry`], the startup-built tag -> handler map

mod registry;

pub use registry::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::Frame;

/// Handler errors
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Unsupported payload: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

pub type HandlerResult = Result<Vec<Frame>, HandlerError>;

/// Processes one inbound frame into zero or more response frames.
///
/// Handlers are shared by every session at once and must not hold mutable
/// state. Returning an error closes the session that delivered the frame.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, frame: Frame) -> HandlerResult;
}

/// Sends every frame back unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, frame: Frame) -> HandlerResult {
        Ok(vec![frame])
    }
}

/// Adapts a plain closure into a [`Handler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Frame) -> HandlerResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(Frame) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, frame: Frame) -> HandlerResult {
        (self.f)(frame)
    }
}
