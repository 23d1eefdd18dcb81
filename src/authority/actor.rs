//! Per-document actor
//!
//! One tokio task owns each live document's `DocumentState`. Every operation
//! on that document arrives as a `Command` on a bounded mailbox and is applied
//! in arrival order, so concurrent lock requests and mutations are totally
//! ordered without any shared locking. The actor also:
//! - delivers the state's outbox through the `Transport`
//! - sweeps expired heartbeats and runs debounced autosave on a tick
//! - retires itself (final save, unmap from the registry) once empty

use super::broadcaster::Delivery;
use super::document::{DepartureReason, DocumentState, JoinSnapshot};
use super::registry::{forget_generation, Documents};
use super::transport::{ConnectionId, Transport};
use crate::config::AuthorityConfig;
use crate::errors::{Result, StoreError, SyncError};
use crate::identity::Identity;
use crate::model::{
    CursorPosition, DiagramGraph, DocumentId, ElementId, LockEntry, LockOutcome, Mutation, Participant,
    ParticipantId, UnlockOutcome,
};
use crate::store::DiagramStore;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const MIN_TICK: Duration = Duration::from_millis(10);

pub type Reply<T> = oneshot::Sender<Result<T>>;

pub enum Command {
    Join {
        identity: Identity,
        connection: ConnectionId,
        resume: bool,
        reply: Reply<JoinSnapshot>,
    },
    /// `connection: Some` only leaves if that connection still owns the
    /// participant's registration.
    Leave {
        participant_id: ParticipantId,
        connection: Option<ConnectionId>,
        reply: Reply<Vec<ElementId>>,
    },
    ListParticipants {
        reply: Reply<Vec<Participant>>,
    },
    TryLock {
        element_id: ElementId,
        participant_id: ParticipantId,
        reply: Reply<LockOutcome>,
    },
    Unlock {
        element_id: ElementId,
        participant_id: ParticipantId,
        reply: Reply<UnlockOutcome>,
    },
    Publish {
        origin: ParticipantId,
        client_seq: u64,
        mutation: Mutation,
        reply: Reply<u64>,
    },
    Cursor {
        participant_id: ParticipantId,
        position: CursorPosition,
        reply: Reply<bool>,
    },
    Heartbeat {
        participant_id: ParticipantId,
        reply: Reply<()>,
    },
    LockSnapshot {
        reply: Reply<Vec<LockEntry>>,
    },
    CursorSnapshot {
        reply: Reply<HashMap<ParticipantId, CursorPosition>>,
    },
    Flush {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Join { .. } => "join",
            Command::Leave { .. } => "leave",
            Command::ListParticipants { .. } => "list_participants",
            Command::TryLock { .. } => "try_lock",
            Command::Unlock { .. } => "unlock",
            Command::Publish { .. } => "publish",
            Command::Cursor { .. } => "cursor",
            Command::Heartbeat { .. } => "heartbeat",
            Command::LockSnapshot { .. } => "lock_snapshot",
            Command::CursorSnapshot { .. } => "cursor_snapshot",
            Command::Flush { .. } => "flush",
            Command::Shutdown { .. } => "shutdown",
        }
    }

    /// Answer without executing. Shutdown of an already-stopping actor is a
    /// success; everything else gets `err`.
    fn refuse(self, err: impl Fn() -> SyncError) {
        match self {
            Command::Join { reply, .. } => drop(reply.send(Err(err()))),
            Command::Leave { reply, .. } => drop(reply.send(Err(err()))),
            Command::ListParticipants { reply } => drop(reply.send(Err(err()))),
            Command::TryLock { reply, .. } => drop(reply.send(Err(err()))),
            Command::Unlock { reply, .. } => drop(reply.send(Err(err()))),
            Command::Publish { reply, .. } => drop(reply.send(Err(err()))),
            Command::Cursor { reply, .. } => drop(reply.send(Err(err()))),
            Command::Heartbeat { reply, .. } => drop(reply.send(Err(err()))),
            Command::LockSnapshot { reply } => drop(reply.send(Err(err()))),
            Command::CursorSnapshot { reply } => drop(reply.send(Err(err()))),
            Command::Flush { reply } => drop(reply.send(Err(err()))),
            Command::Shutdown { reply } => drop(reply.send(Ok(()))),
        }
    }
}

/// Cloneable address of a document actor.
#[derive(Clone)]
pub struct DocumentHandle {
    document_id: DocumentId,
    generation: u64,
    tx: mpsc::Sender<Command>,
}

impl DocumentHandle {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Distinguishes successive actors for the same document id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| SyncError::DocumentRetired)
    }

    /// Send a command built around a fresh reply channel and await the answer.
    pub async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| SyncError::DocumentRetired)?
    }
}

/// Start the actor for `document_id`. The persisted graph is loaded inside the
/// task, before the first command is served.
pub fn spawn(
    document_id: DocumentId,
    generation: u64,
    config: AuthorityConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DiagramStore>,
    registry: Weak<Documents>,
) -> DocumentHandle {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let handle = DocumentHandle {
        document_id: document_id.clone(),
        generation,
        tx,
    };

    tokio::spawn(async move {
        let actor = DocumentActor {
            state: None,
            document_id,
            generation,
            config,
            transport,
            store,
            registry,
            has_had_members: false,
        };
        actor.run(rx).await;
    });

    handle
}

struct DocumentActor {
    state: Option<DocumentState>,
    document_id: DocumentId,
    generation: u64,
    config: AuthorityConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DiagramStore>,
    registry: Weak<Documents>,
    has_had_members: bool,
}

enum Exit {
    Retired,
    Shutdown(Reply<()>),
    MailboxClosed,
}

impl DocumentActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let graph = match self.load().await {
            Ok(graph) => graph,
            Err(e) => {
                error!(document = %self.document_id, error = %e, "Failed to load diagram");
                let message = e.to_string();
                self.unmap().await;
                rx.close();
                while let Some(command) = rx.recv().await {
                    command.refuse(|| SyncError::Store(StoreError::Unavailable(message.clone())));
                }
                return;
            }
        };
        self.state = Some(DocumentState::new(self.document_id.clone(), graph, &self.config));

        let period = self
            .config
            .heartbeat_interval()
            .min(self.config.autosave_debounce())
            .checked_div(2)
            .unwrap_or(MIN_TICK)
            .max(MIN_TICK);
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => break Exit::Shutdown(reply),
                    Some(command) => self.handle(command).await,
                    None => break Exit::MailboxClosed,
                },
                _ = tick.tick() => self.on_tick().await,
            }

            if self.should_retire() {
                break Exit::Retired;
            }
        };

        let saved = self.save().await;
        if let Err(e) = &saved {
            warn!(document = %self.document_id, error = %e, "Final save failed");
        }

        match exit {
            Exit::Shutdown(reply) => {
                info!(document = %self.document_id, "Document session stopped");
                let _ = reply.send(saved);
            }
            Exit::MailboxClosed => {
                debug!(document = %self.document_id, "Document mailbox closed");
            }
            Exit::Retired => {
                self.unmap().await;
                info!(document = %self.document_id, generation = self.generation, "Document session retired");
            }
        }

        rx.close();
        while let Some(command) = rx.recv().await {
            debug!(document = %self.document_id, command = command.name(), "Refusing command after retirement");
            command.refuse(|| SyncError::DocumentRetired);
        }
    }

    async fn load(&self) -> Result<DiagramGraph> {
        match self.store.load_diagram(&self.document_id).await? {
            Some(blob) => {
                let graph = DiagramGraph::from_json(&blob).map_err(|e| StoreError::Corrupted(e.to_string()))?;
                debug!(document = %self.document_id, elements = graph.len(), "Diagram loaded");
                Ok(graph)
            }
            None => Ok(DiagramGraph::new()),
        }
    }

    async fn save(&mut self) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        if !state.is_dirty() {
            return Ok(());
        }
        let blob = state
            .graph()
            .to_json()
            .map_err(|e| SyncError::Internal(format!("graph serialization failed: {}", e)))?;
        self.store.save_diagram(&self.document_id, &blob).await?;
        state.mark_saved();
        debug!(document = %self.document_id, bytes = blob.len(), "Diagram saved");
        Ok(())
    }

    async fn unmap(&self) {
        if let Some(documents) = self.registry.upgrade() {
            forget_generation(&documents, &self.document_id, self.generation).await;
        }
    }

    fn should_retire(&self) -> bool {
        !self.config.retain_empty_documents
            && self.has_had_members
            && self.state.as_ref().is_some_and(|s| s.is_empty())
    }

    async fn handle(&mut self, command: Command) {
        let Some(state) = self.state.as_mut() else {
            command.refuse(|| SyncError::DocumentRetired);
            return;
        };
        let now = Instant::now();

        match command {
            Command::Join {
                identity,
                connection,
                resume,
                reply,
            } => {
                self.has_had_members = true;
                let snapshot = state.join(&identity, connection, resume, now);
                self.dispatch();
                let _ = reply.send(Ok(snapshot));
            }
            Command::Leave {
                participant_id,
                connection,
                reply,
            } => {
                let departure = match connection {
                    Some(connection) => state.disconnect(&participant_id, connection),
                    None => state.leave(&participant_id, DepartureReason::Explicit),
                };
                self.dispatch();
                let _ = reply.send(Ok(departure.map(|d| d.released).unwrap_or_default()));
            }
            Command::ListParticipants { reply } => {
                let _ = reply.send(Ok(state.list_participants()));
            }
            Command::TryLock {
                element_id,
                participant_id,
                reply,
            } => {
                let result = state.try_lock(&element_id, &participant_id, now);
                self.dispatch();
                let _ = reply.send(result);
            }
            Command::Unlock {
                element_id,
                participant_id,
                reply,
            } => {
                let result = state.unlock(&element_id, &participant_id, now);
                self.dispatch();
                let _ = reply.send(result);
            }
            Command::Publish {
                origin,
                client_seq,
                mutation,
                reply,
            } => {
                let result = state.publish(&origin, client_seq, mutation, now);
                self.dispatch();
                let _ = reply.send(result);
            }
            Command::Cursor {
                participant_id,
                position,
                reply,
            } => {
                let result = state.update_cursor(&participant_id, position, now);
                self.dispatch();
                let _ = reply.send(result);
            }
            Command::Heartbeat { participant_id, reply } => {
                let _ = reply.send(state.heartbeat(&participant_id, now));
            }
            Command::LockSnapshot { reply } => {
                let _ = reply.send(Ok(state.lock_snapshot()));
            }
            Command::CursorSnapshot { reply } => {
                let _ = reply.send(Ok(state.cursor_snapshot()));
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.save().await);
            }
            // Intercepted by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let Some(state) = self.state.as_mut() else {
            return;
        };

        let departures = state.expire_silent(now);
        for departure in &departures {
            warn!(
                document = %self.document_id,
                participant = %departure.participant.participant_id,
                released = departure.released.len(),
                "Participant missed heartbeats, removed"
            );
        }
        if !departures.is_empty() {
            self.dispatch();
        }

        let due = self
            .state
            .as_ref()
            .is_some_and(|s| s.autosave_due(now, self.config.autosave_debounce()));
        if due {
            if let Err(e) = self.save().await {
                warn!(document = %self.document_id, error = %e, "Autosave failed");
            }
        }
    }

    /// Drain the outbox into the transport. A participant whose delivery
    /// fails is removed through the normal leave path, which may queue more.
    fn dispatch(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };

        loop {
            let outbox: Vec<Delivery> = state.take_outbox();
            if outbox.is_empty() {
                break;
            }

            let mut lost: BTreeSet<ParticipantId> = BTreeSet::new();
            for Delivery { to, message } in outbox {
                if lost.contains(&to) {
                    continue;
                }
                if let Err(e) = self.transport.send(&to, message) {
                    warn!(document = %self.document_id, participant = %to, error = %e, "Delivery failed");
                    lost.insert(to);
                }
            }

            for participant_id in lost {
                state.leave(&participant_id, DepartureReason::TransportLost);
            }
        }
    }
}
