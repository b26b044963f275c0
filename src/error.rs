//! Error kinds for the loop (see spec §7). Written by hand, in the style
//! of the teacher's `ConfigError` (`impl Display` + `impl std::error::Error`,
//! no `thiserror`).

use std::fmt;
use std::io;

/// A per-connection or loop-wide error. Every per-connection variant leads
/// to `drop` before any registered callback fires, so user code always
/// observes an already-closed id alongside the error.
#[derive(Debug)]
pub enum LoopError {
    /// A listen or connect socket could not be constructed. Reported
    /// synchronously to the caller; fatal for that one operation, not the
    /// loop as a whole.
    ConstructionFailure(io::Error),
    /// A staged inbound socket did not reach `connected` within the
    /// configured accept timeout.
    AcceptTimeout,
    /// An outbound connection never reached established within the
    /// configured connect timeout.
    ConnectTimeout,
    /// A read or write syscall returned an unrecoverable result.
    TransportError(io::Error),
    /// The loop-wide backend could not be constructed, or a listen bind
    /// failed during `Loop` setup. Fatal and surfaced synchronously.
    Fatal(String),
}

impl LoopError {
    /// The message used when a transport error has no more specific
    /// context (see §7: "Connection error on poll layer.").
    pub fn transport_default() -> Self {
        LoopError::TransportError(io::Error::new(
            io::ErrorKind::Other,
            "Connection error on poll layer.",
        ))
    }
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::ConstructionFailure(e) => write!(f, "Construction failure: {e}"),
            LoopError::AcceptTimeout => write!(f, "Accept timeout."),
            LoopError::ConnectTimeout => write!(f, "Connect timeout."),
            LoopError::TransportError(e) => write!(f, "{e}"),
            LoopError::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for LoopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoopError::ConstructionFailure(e) | LoopError::TransportError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LoopError {
    fn from(e: io::Error) -> Self {
        LoopError::TransportError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_spec() {
        assert_eq!(LoopError::AcceptTimeout.to_string(), "Accept timeout.");
        assert_eq!(LoopError::ConnectTimeout.to_string(), "Connect timeout.");
        assert_eq!(
            LoopError::transport_default().to_string(),
            "Connection error on poll layer."
        );
    }
}
