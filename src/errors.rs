use crate::model::{ElementId, ParticipantId};
use std::path::PathBuf;
use thiserror::Error;

/// The central error type for diagram synchronization.
///
/// Everything in the collaboration taxonomy (`Unauthorized`, `LockDenied`,
/// `TransportLost`, `ConflictOnReplay`) is a local, recoverable condition
/// surfaced to the participant. None of them tears down a document session.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Element {element_id} is locked by {holder}")]
    LockDenied {
        element_id: ElementId,
        holder: ParticipantId,
    },

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Buffered change to {element_id} conflicts with a lock held by {holder}")]
    ConflictOnReplay {
        element_id: ElementId,
        holder: ParticipantId,
    },

    #[error("Participant {0} has not joined this document")]
    NotJoined(ParticipantId),

    #[error("Document session was retired")]
    DocumentRetired,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Stable machine-readable code sent to clients in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Unauthorized(_) => "unauthorized",
            SyncError::LockDenied { .. } => "lock_denied",
            SyncError::TransportLost(_) => "transport_lost",
            SyncError::ConflictOnReplay { .. } => "conflict_on_replay",
            SyncError::NotJoined(_) => "not_joined",
            SyncError::DocumentRetired => "document_retired",
            SyncError::Store(_) => "store",
            SyncError::Transport(_) => "transport",
            SyncError::Protocol(_) => "protocol",
            SyncError::Config(_) => "config",
            SyncError::Internal(_) => "internal",
        }
    }

    /// Whether the session can carry on after surfacing this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::Config(_) | SyncError::Internal(_))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Stored diagram is corrupted: {0}")]
    Corrupted(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Participant {0} is not connected")]
    NotConnected(ParticipantId),

    #[error("Outbound channel closed for {0}")]
    Closed(ParticipantId),

    #[error("Outbound queue full for {0}")]
    Backlogged(ParticipantId),
}

pub type Result<T> = std::result::Result<T, SyncError>;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_AUTH_ERROR: u8 = 3;
pub const EXIT_STORE_ERROR: u8 = 4;

/// Determine the appropriate process exit code for an error.
pub fn get_exit_code(e: &anyhow::Error) -> u8 {
    if let Some(sync_err) = e.downcast_ref::<SyncError>() {
        return match sync_err {
            SyncError::Config(_) => EXIT_CONFIG_ERROR,
            SyncError::Unauthorized(_) => EXIT_AUTH_ERROR,
            SyncError::Store(_) => EXIT_STORE_ERROR,
            _ => EXIT_ERROR,
        };
    }

    if e.downcast_ref::<StoreError>().is_some() {
        return EXIT_STORE_ERROR;
    }
    if e.downcast_ref::<toml::de::Error>().is_some() {
        return EXIT_CONFIG_ERROR;
    }

    EXIT_ERROR
}
