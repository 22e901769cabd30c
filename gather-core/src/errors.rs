//! Error type for gather-core.

use std::{fmt, io};

use gather_client::ClientError;
use gather_store::StoreError;

// ─── CoreError ────────────────────────────────────────────────────────────────

/// The error type returned from core operations that talk to the store,
/// the filesystem, or a client handle.
#[derive(Debug)]
pub enum CoreError {
    /// Durable store failure.
    Store(StoreError),
    /// Client handle failure.
    Client(ClientError),
    /// Credential file I/O failure.
    Io(io::Error),
    /// The referenced QR attempt does not exist (or was already observed).
    AttemptNotFound(String),
    /// The attempt is not in a state that allows the requested operation.
    InvalidAttemptState { name: String, state: &'static str },
    /// A privileged attempt was refused (one already live, or an admin
    /// session already exists).
    AdminAttemptRefused(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e)  => write!(f, "store error: {e}"),
            Self::Client(e) => write!(f, "client error: {e}"),
            Self::Io(e)     => write!(f, "I/O error: {e}"),
            Self::AttemptNotFound(name) => write!(f, "no such QR attempt: {name}"),
            Self::InvalidAttemptState { name, state } => {
                write!(f, "QR attempt {name} is {state}; operation not valid")
            }
            Self::AdminAttemptRefused(reason) => write!(f, "admin attempt refused: {reason}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self { Self::Store(e) }
}

impl From<ClientError> for CoreError {
    fn from(e: ClientError) -> Self { Self::Client(e) }
}

impl From<io::Error> for CoreError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}
