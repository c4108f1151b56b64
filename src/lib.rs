//! Dawn relay - tagged-frame message server
//!
//! Accepts connections, greets each one, and answers every length-prefixed,
//! tagged frame through a per-tag handler, echoing tags nobody registered.

pub mod config;
pub mod handler;
pub mod network;
pub mod protocol;

pub use handler::{
    EchoHandler, FnHandler, Handler, HandlerError, HandlerRegistry, UnknownTagPolicy,
};
pub use network::{Client, NetworkConfig, Server, ServerEvent, Session, SessionHandle};
pub use protocol::{tags, Frame, FrameCodec};
