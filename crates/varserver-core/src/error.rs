use thiserror::Error;
use varserver_net::NetError;

/// Handshake or transport failure. Fatal for the owning worker: it
/// transitions to `EXITING` and removes itself from the registry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection handshake failed")]
    HandshakeFailed,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transport error: {0}")]
    Transport(#[from] NetError),
}

/// Malformed or unrecognized command text. Recovered locally: the session
/// replies with a diagnostic frame (message-id 3) and continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized command: {0}")]
    UnknownCommand(String),
    #[error("malformed argument list in: {0}")]
    MalformedArguments(String),
}

/// A variable name could not be resolved against the memory map. `add()`
/// replies with a diagnostic and does not insert a reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("variable not found: {0}")]
    NotFound(String),
    #[error("invalid subscript or field path: {0}")]
    InvalidPath(String),
}

/// `set_update_rate` received a non-positive value; the caller clamps to the
/// minimum representable cycle instead of rejecting the command outright.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateError {
    #[error("update rate must be positive, clamped to minimum cycle")]
    NonPositive,
}

/// Propagated from a scheduled callback driven by the simulation executive.
/// The worker that observes it logs and exits; the server and its other
/// sessions are unaffected.
#[derive(Debug, Error)]
#[error("fatal executive exception: {0}")]
pub struct FatalExecutiveException(pub String);
