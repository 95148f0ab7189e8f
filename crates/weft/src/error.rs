// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types surfaced by the fabric.

use std::fmt;
use std::io;

/// Result type for fabric operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during node operations.
#[derive(Debug)]
pub enum Error {
    /// Topic name does not match the required form.
    InvalidTopic(String),

    /// Publish was attempted on a topic this node never advertised.
    NotAdvertised(String),

    /// The process already has a replier bound to this service.
    AlreadyAdvertised(String),

    /// Payload serialization or type-name disagreement.
    TypeMismatch(String),

    /// Blocking request deadline expired before a response arrived.
    Timeout,

    /// No responder is known for the service.
    NoResponder(String),

    /// Socket-level failure (non-fatal; reconciled by the next heartbeat).
    Transport(io::Error),

    /// The per-process runtime was already torn down.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopic(topic) => write!(f, "invalid topic name: '{}'", topic),
            Self::NotAdvertised(topic) => {
                write!(f, "topic '{}' has not been advertised by this node", topic)
            }
            Self::AlreadyAdvertised(topic) => {
                write!(f, "service '{}' already has a replier in this process", topic)
            }
            Self::TypeMismatch(msg) => write!(f, "message type mismatch: {}", msg),
            Self::Timeout => write!(f, "request timed out"),
            Self::NoResponder(topic) => write!(f, "no responder known for '{}'", topic),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Shutdown => write!(f, "fabric runtime shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_topic() {
        let err = Error::NotAdvertised("/foo".to_string());
        assert!(err.to_string().contains("/foo"));

        let err = Error::AlreadyAdvertised("/echo".to_string());
        assert!(err.to_string().contains("/echo"));
    }

    #[test]
    fn io_error_converts_to_transport() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Transport(_)));
    }
}
