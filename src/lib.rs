//! diagramsync - real-time collaboration for shared diagram editing
//!
//! One authority keeps every participant of a document consistent:
//!
//! - **Documents**: one actor per open document, lazily created on first join
//! - **Presence**: roster, cursors and heartbeat-based departure detection
//! - **Locks**: exclusive, non-blocking element locks released on leave
//! - **Mutations**: ordered fan-out to every participant except the origin
//! - **Client**: echo suppression and reconnection with replay of buffered edits
//!
//! # Quick Start
//!
//! ```ignore
//! use diagramsync::{Authority, ConnectionId, RecordingTransport, SignedTokenProvider};
//! use diagramsync::store::MemoryStore;
//!
//! let tokens = SignedTokenProvider::new("secret", chrono::Duration::hours(1));
//! let authority = Authority::new(
//!     Arc::new(RecordingTransport::new()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(tokens),
//!     Default::default(),
//! );
//! let snapshot = authority.join(&"D1".into(), &credential, ConnectionId::new(), false).await?;
//! ```

pub mod authority;
pub mod cli;
pub mod client;
pub mod config;
pub mod errors;
pub mod identity;
pub mod model;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod store;

pub use authority::{Authority, ConnectionId, JoinSnapshot, RecordingTransport, Transport};
pub use client::{ClientEvent, ClientSession, EchoSuppressor, ReconnectCoordinator};
pub use config::Config;
pub use errors::{Result, StoreError, SyncError, TransportError};
pub use identity::{Credential, Identity, IdentityProvider, SignedTokenProvider};
pub use model::{DiagramGraph, DocumentId, ElementId, Mutation, ParticipantId};
pub use protocol::{ClientMessage, ServerMessage};
