//! Participant side of the synchronization protocol
//!
//! - **echo**: keeps remote applies from being republished
//! - **session**: sans-IO state machine driving one participant
//! - **reconnect**: retry budget and replay planning
//! - **events**: typed notifications for the presentation layer

pub mod echo;
pub mod events;
pub mod reconnect;
pub mod session;

pub use echo::{EchoSuppressor, SuppressionGuard};
pub use events::{ClientEvent, Notification, Severity};
pub use reconnect::{plan_replay, BackoffPolicy, PendingMutation, ReconnectCoordinator, ReconnectState, ReplayPlan};
pub use session::{ClientSession, DiagramModel, LinkState, LocalOutcome};
