#![allow(dead_code)]

//! In-process wiring of client sessions to an authority.
//!
//! Mirrors what the TCP connection layer does with each client message, but
//! delivers through `RecordingTransport` so tests control every hop.

use diagramsync::authority::{Authority, ConnectionId, RecordingTransport};
use diagramsync::client::{BackoffPolicy, ClientSession, DiagramModel, EchoSuppressor};
use diagramsync::config::AuthorityConfig;
use diagramsync::identity::{Credential, SignedTokenProvider};
use diagramsync::model::{DiagramGraph, DocumentId, Mutation, ParticipantId};
use diagramsync::protocol::{ClientMessage, ServerMessage};
use diagramsync::store::MemoryStore;
use diagramsync::SyncError;
use std::sync::Arc;
use std::time::Duration;

/// A diagram model with a change listener. Every change the listener sees
/// outside a remote apply would be republished by a real editor.
#[derive(Default)]
pub struct ListeningModel {
    pub graph: DiagramGraph,
    pub echo: EchoSuppressor,
    pub republished: Vec<Mutation>,
}

impl DiagramModel for ListeningModel {
    fn apply(&mut self, mutation: &Mutation) {
        self.graph.apply(mutation);
        if !self.echo.is_suppressing() {
            self.republished.push(mutation.clone());
        }
    }

    fn replace(&mut self, graph: &DiagramGraph) {
        self.graph = graph.clone();
    }
}

pub struct Peer {
    pub session: ClientSession<ListeningModel>,
    pub connection: ConnectionId,
    pub online: bool,
    /// Mutate messages this peer actually put on the wire.
    pub published: Vec<Mutation>,
    pub inbox: Vec<ServerMessage>,
}

impl Peer {
    pub fn id(&self) -> ParticipantId {
        self.session.participant_id().clone()
    }
}

pub struct Harness {
    pub authority: Authority,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<MemoryStore>,
    tokens: SignedTokenProvider,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AuthorityConfig::default())
    }

    pub fn with_config(config: AuthorityConfig) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    pub fn with_store(config: AuthorityConfig, store: MemoryStore) -> Self {
        let transport = Arc::new(RecordingTransport::new());
        let store = Arc::new(store);
        let authority = Authority::new(
            transport.clone(),
            store.clone(),
            Arc::new(SignedTokenProvider::new("harness-secret", chrono::Duration::hours(1))),
            config,
        );
        Self {
            authority,
            transport,
            store,
            tokens: SignedTokenProvider::new("harness-secret", chrono::Duration::hours(1)),
        }
    }

    pub fn credential(&self, id: &str, name: &str) -> Credential {
        self.tokens.issue(id, name)
    }

    pub fn peer(&self, id: &str, name: &str) -> Peer {
        self.peer_with_credential(self.tokens.issue(id, name))
    }

    pub fn peer_with_credential(&self, credential: Credential) -> Peer {
        let backoff = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 3);
        let mut session = ClientSession::new(
            credential,
            ListeningModel::default(),
            backoff,
            Duration::ZERO,
        );
        let echo = session.echo_suppressor();
        session.model_mut().echo = echo;
        Peer {
            session,
            connection: ConnectionId::new(),
            online: true,
            published: Vec::new(),
            inbox: Vec::new(),
        }
    }

    /// Forward and deliver until nothing is left in flight.
    pub async fn settle(&self, peers: &mut [&mut Peer]) {
        for _ in 0..32 {
            let mut sent = false;
            for peer in peers.iter_mut() {
                sent |= self.forward(peer).await;
            }
            let delivered = self.deliver(peers);
            if !sent && !delivered {
                return;
            }
        }
        panic!("harness did not settle");
    }

    /// Simulate the socket dropping: the authority sees a disconnect and the
    /// client sees a transport loss.
    pub async fn drop_link(&self, peer: &mut Peer) {
        peer.online = false;
        self.transport.set_unreachable(peer.id(), true);
        if let Some(document_id) = peer.session.document_id().cloned() {
            let _ = self
                .authority
                .disconnect(&document_id, &peer.id(), peer.connection)
                .await;
        }
        peer.session.transport_lost();
    }

    pub fn restore_link(&self, peer: &mut Peer) {
        peer.online = true;
        peer.connection = ConnectionId::new();
        self.transport.set_unreachable(peer.id(), false);
        peer.session.transport_restored();
    }

    async fn forward(&self, peer: &mut Peer) -> bool {
        let outbox = peer.session.take_outbox();
        if outbox.is_empty() || !peer.online {
            return false;
        }
        let participant_id = peer.id();
        for message in outbox {
            let reply = self.handle(peer, &participant_id, message).await;
            if let Some(reply) = reply {
                peer.inbox.push(reply.clone());
                peer.session.handle_message(reply);
            }
        }
        true
    }

    /// Returns a message the connection itself answers with, if any.
    async fn handle(&self, peer: &mut Peer, participant_id: &ParticipantId, message: ClientMessage) -> Option<ServerMessage> {
        let document_id = message.document_id().cloned();
        let result = match message {
            ClientMessage::Join {
                document_id,
                credential,
                resume,
            } => self
                .authority
                .join(&document_id, &credential, peer.connection, resume)
                .await
                .map(|_| ()),
            ClientMessage::Leave { document_id } => {
                self.authority.leave(&document_id, participant_id).await.map(|_| ())
            }
            ClientMessage::Mutate {
                document_id,
                client_seq,
                mutation,
            } => {
                peer.published.push(mutation.clone());
                match self
                    .authority
                    .publish(&document_id, participant_id, client_seq, mutation.clone())
                    .await
                {
                    Err(e @ SyncError::NotJoined(_)) => {
                        return Some(ServerMessage::MutationRejected {
                            document_id,
                            element_id: mutation.element_id,
                            client_seq,
                            code: e.code().to_string(),
                            message: e.to_string(),
                        })
                    }
                    other => other.map(|_| ()),
                }
            }
            ClientMessage::Lock {
                document_id,
                element_id,
            } => self
                .authority
                .try_lock(&document_id, &element_id, participant_id)
                .await
                .map(|_| ()),
            ClientMessage::Unlock {
                document_id,
                element_id,
            } => self
                .authority
                .unlock(&document_id, &element_id, participant_id)
                .await
                .map(|_| ()),
            ClientMessage::Cursor { document_id, position } => self
                .authority
                .update_cursor(&document_id, participant_id, position)
                .await
                .map(|_| ()),
            ClientMessage::Ping => {
                if let Some(document_id) = peer.session.document_id().cloned() {
                    let _ = self.authority.heartbeat(&document_id, participant_id).await;
                }
                return Some(ServerMessage::Pong);
            }
        };
        match result {
            Ok(()) | Err(SyncError::LockDenied { .. }) => None,
            Err(e) => Some(ServerMessage::error(document_id, &e)),
        }
    }

    fn deliver(&self, peers: &mut [&mut Peer]) -> bool {
        let deliveries = self.transport.drain();
        let delivered = !deliveries.is_empty();
        for delivery in deliveries {
            if let Some(peer) = peers.iter_mut().find(|p| p.id() == delivery.to && p.online) {
                peer.inbox.push(delivery.message.clone());
                peer.session.handle_message(delivery.message);
            }
        }
        delivered
    }
}

pub fn doc(id: &str) -> DocumentId {
    id.into()
}
