//! Tag -> handler map shared by all sessions

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{FnHandler, Handler, HandlerResult};
use crate::protocol::{is_reserved, tag_name, Frame};

/// What a session does with a frame whose tag is neither reserved nor
/// registered, when strict tag validation is on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTagPolicy {
    /// Close the connection
    Reject,
    /// Treat it like any other unhandled tag and echo it
    #[default]
    Echo,
}

/// Result of looking up a tag
pub enum Dispatch<'a> {
    /// A registered handler
    Handler(&'a Arc<dyn Handler>),
    /// No handler; the session echoes the frame
    Echo,
    /// Unknown tag under strict validation with [`UnknownTagPolicy::Reject`]
    Reject,
}

/// Maps tags to handlers.
///
/// Built with `&mut self` during startup, then moved into the server and
/// shared behind an `Arc`, so there is no way to register once sessions
/// are running.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u8, Arc<dyn Handler>>,
    strict_tags: bool,
    unknown_tag_policy: UnknownTagPolicy,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable strict tag validation with the given policy for unknown tags
    pub fn with_strict_tags(mut self, policy: UnknownTagPolicy) -> Self {
        self.strict_tags = true;
        self.unknown_tag_policy = policy;
        self
    }

    /// Associate a handler with a tag, replacing any previous one
    pub fn register<H>(&mut self, tag: u8, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        if self.handlers.insert(tag, Arc::new(handler)).is_some() {
            tracing::warn!(tag, "Replacing previously registered handler");
        } else {
            tracing::debug!(tag, kind = tag_name(tag).unwrap_or("custom"), "Registered handler");
        }
        self
    }

    /// Register a closure as the handler for a tag
    pub fn register_fn<F>(&mut self, tag: u8, f: F) -> &mut Self
    where
        F: Fn(Frame) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(tag, FnHandler::new(f))
    }

    /// Get the handler registered for a tag
    pub fn lookup(&self, tag: u8) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(&tag)
    }

    /// A tag is known when it is reserved or has a handler
    pub fn is_known(&self, tag: u8) -> bool {
        is_reserved(tag) || self.handlers.contains_key(&tag)
    }

    /// Decide how a frame with this tag is processed
    pub fn dispatch(&self, tag: u8) -> Dispatch<'_> {
        if let Some(handler) = self.lookup(tag) {
            return Dispatch::Handler(handler);
        }
        if self.strict_tags
            && !is_reserved(tag)
            && self.unknown_tag_policy == UnknownTagPolicy::Reject
        {
            return Dispatch::Reject;
        }
        Dispatch::Echo
    }

    pub fn strict_tags(&self) -> bool {
        self.strict_tags
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered tags in ascending order
    pub fn tags(&self) -> Vec<u8> {
        let mut tags: Vec<u8> = self.handlers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tags", &self.tags())
            .field("strict_tags", &self.strict_tags)
            .field("unknown_tag_policy", &self.unknown_tag_policy)
            .finish()
    }
}
