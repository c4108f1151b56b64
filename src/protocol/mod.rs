//! Protocol module - Defines the wire protocol for Dawn relay communication
//!
//! Every message on the wire is a single tagged frame:
//! - 4 bytes length (big-endian), counting the tag and payload but not itself
//! - 1 byte tag
//! - `length - 1` bytes of payload

mod codec;
mod frame;

pub use codec::*;
pub use frame::*;

/// Default port for Dawn communication
pub const DEFAULT_PORT: u16 = 8107;

/// Default interface the server listens on
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Payload of the greeting frame sent to every new connection
pub const DEFAULT_GREETING: &[u8] = b"cheese";

/// Default upper bound on a single frame's payload (10 MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;
