use bridge_traits::error::BridgeError;
use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Admission denied by {node_id}")]
    AdmissionDenied { node_id: String },

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Invalid selection: {} unknown item(s)", .unknown.len())]
    IndexInvalidSelection { unknown: Vec<String> },

    #[error("Transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Transfer job {job_id} not found")]
    JobNotFound { job_id: u64 },

    #[error("No {direction} connection with {node_id}")]
    ConnectionNotFound { node_id: String, direction: String },

    #[error("Connection with {node_id} is {state}, expected {expected}")]
    InvalidConnectionState {
        node_id: String,
        state: String,
        expected: String,
    },

    #[error("No index received from {node_id}")]
    NoRemoteIndex { node_id: String },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Library error: {0}")]
    Library(LibraryError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LibraryError> for SyncError {
    fn from(err: LibraryError) -> Self {
        match err {
            LibraryError::InvalidSelection { unknown } => {
                SyncError::IndexInvalidSelection { unknown }
            }
            other => SyncError::Library(other),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(format!("malformed message: {}", err))
    }
}

impl SyncError {
    /// True when the error only means the peer or the owner ended the session.
    pub fn is_session_closed(&self) -> bool {
        match self {
            SyncError::SessionClosed(_) => true,
            SyncError::Bridge(e) => e.is_connection_closed(),
            SyncError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
