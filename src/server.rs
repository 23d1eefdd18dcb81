//! TCP transport adapter
//!
//! Carries newline-delimited JSON `ClientMessage` / `ServerMessage` records
//! over plain TCP. Each connection gets a writer task fed by a bounded
//! channel; `ConnectionHub` maps authenticated participants to those
//! channels and is the `Transport` the authority delivers through.
//!
//! When a connection closes or fails, the leave path runs for every document
//! it joined, so its locks are released. A participant whose queue fills up
//! (the peer stopped reading) is refused delivery and dropped by the
//! document the same way. Inbound lines longer than `max_line_bytes` close
//! the connection.

use crate::authority::{Authority, ConnectionId, Transport};
use crate::config::ServerConfig;
use crate::errors::{SyncError, TransportError};
use crate::model::{DocumentId, ParticipantId};
use crate::observability::telemetry::{connection_span, redact_token, sanitize_for_log};
use crate::protocol::{ClientMessage, ServerMessage};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn, Instrument};

// ============================================================================
// Connection hub
// ============================================================================

struct Route {
    connection: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
}

/// Participant id → outbound channel of its current connection.
pub struct ConnectionHub {
    routes: RwLock<HashMap<ParticipantId, Route>>,
    outbound_queue: usize,
    max_line_bytes: usize,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::with_config(&ServerConfig::default())
    }
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &ServerConfig) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            outbound_queue: config.outbound_queue.max(1),
            max_line_bytes: config.max_line_bytes.max(1),
        }
    }

    /// Route `participant_id` to `tx`, replacing any older connection.
    /// Returns the replaced connection.
    pub fn register(
        &self,
        participant_id: ParticipantId,
        connection: ConnectionId,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Option<ConnectionId> {
        self.routes
            .write()
            .insert(participant_id, Route { connection, tx })
            .map(|old| old.connection)
            .filter(|old| *old != connection)
    }

    /// Drop the route only if it still belongs to `connection`.
    pub fn deregister(&self, participant_id: &ParticipantId, connection: ConnectionId) -> bool {
        let mut routes = self.routes.write();
        if routes
            .get(participant_id)
            .is_some_and(|route| route.connection == connection)
        {
            routes.remove(participant_id);
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self, participant_id: &ParticipantId) -> bool {
        self.routes.read().contains_key(participant_id)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl Transport for ConnectionHub {
    fn send(&self, to: &ParticipantId, message: ServerMessage) -> Result<(), TransportError> {
        let routes = self.routes.read();
        let route = routes
            .get(to)
            .ok_or_else(|| TransportError::NotConnected(to.clone()))?;
        route.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backlogged(to.clone()),
            TrySendError::Closed(_) => TransportError::Closed(to.clone()),
        })
    }
}

// ============================================================================
// Accept loop
// ============================================================================

/// Accept connections until `shutdown` resolves, then flush every document.
pub async fn serve(
    listener: TcpListener,
    authority: Authority,
    hub: Arc<ConnectionHub>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let local = listener.local_addr().context("Failed to read listener address")?;
    info!(address = %local, "Accepting connections");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let authority = authority.clone();
                    let hub = Arc::clone(&hub);
                    tokio::spawn(handle_connection(stream, peer, authority, hub));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }

    authority.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, authority: Authority, hub: Arc<ConnectionHub>) {
    let connection = ConnectionId::new();
    let span = connection_span(&peer.to_string(), &connection.to_string());
    run_connection(stream, connection, authority, hub)
        .instrument(span)
        .await;
}

async fn run_connection(stream: TcpStream, connection: ConnectionId, authority: Authority, hub: Arc<ConnectionHub>) {
    debug!("Connection opened");
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(hub.outbound_queue);
    let max_line_bytes = hub.max_line_bytes;

    let writer_task = tokio::spawn(
        async move {
            while let Some(message) = rx.recv().await {
                let line = match message.to_json() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Dropping unserializable message");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    debug!(error = %e, "Write failed, closing writer");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let mut state = ConnectionState::new(connection, tx);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line(&mut reader, &mut buf, max_line_bytes).await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                state.handle_line(line, &authority, &hub).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Read failed, closing connection");
                if e.kind() == std::io::ErrorKind::InvalidData {
                    state.reply_error(None, &SyncError::Protocol(e.to_string()));
                }
                break;
            }
        }
    }

    state.close(&authority, &hub).await;
    drop(state);
    let _ = writer_task.await;
    debug!("Connection closed");
}

/// Read one newline-terminated line of at most `limit` bytes into `buf`.
/// `Ok(None)` at end of stream; `InvalidData` for an oversized or non-UTF-8
/// line.
async fn read_line<'a, R>(reader: &mut R, buf: &'a mut Vec<u8>, limit: usize) -> std::io::Result<Option<&'a str>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader).take(limit as u64 + 1).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", limit),
        ));
    }
    std::str::from_utf8(buf)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn write_line(writer: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

// ============================================================================
// Per-connection protocol state
// ============================================================================

struct ConnectionState {
    connection: ConnectionId,
    participant: Option<ParticipantId>,
    joined: BTreeSet<DocumentId>,
    tx: mpsc::Sender<ServerMessage>,
}

impl ConnectionState {
    fn new(connection: ConnectionId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            connection,
            participant: None,
            joined: BTreeSet::new(),
            tx,
        }
    }

    /// Messages that do not go through a document actor.
    /// Dropped when the queue is full; a peer that stopped reading is
    /// removed by the next document delivery.
    fn reply(&self, message: ServerMessage) {
        if let Err(e) = self.tx.try_send(message) {
            debug!(error = %e, "Dropping connection reply");
        }
    }

    fn reply_error(&self, document_id: Option<DocumentId>, err: &SyncError) {
        self.reply(ServerMessage::error(document_id, err));
    }

    async fn handle_line(&mut self, line: &str, authority: &Authority, hub: &ConnectionHub) {
        let message = match ClientMessage::from_json(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(line = %redact_token(&sanitize_for_log(line)), error = %e, "Malformed client message");
                self.reply_error(None, &e);
                return;
            }
        };

        match message {
            ClientMessage::Ping => {
                self.reply(ServerMessage::Pong);
                if let Some(participant_id) = &self.participant {
                    for document_id in &self.joined {
                        let _ = authority.heartbeat(document_id, participant_id).await;
                    }
                }
            }
            ClientMessage::Join {
                document_id,
                credential,
                resume,
            } => {
                let identity = match authority.authenticate(&credential) {
                    Ok(identity) => identity,
                    Err(e) => {
                        self.reply_error(Some(document_id), &e);
                        return;
                    }
                };
                if let Some(bound) = &self.participant {
                    if *bound != identity.participant_id {
                        let err = SyncError::Unauthorized(format!("connection is bound to participant {}", bound));
                        self.reply_error(Some(document_id), &err);
                        return;
                    }
                }

                let participant_id = identity.participant_id.clone();
                self.participant = Some(participant_id.clone());
                if let Some(old) = hub.register(participant_id.clone(), self.connection, self.tx.clone()) {
                    info!(participant = %participant_id, replaced = %old, "Participant reconnected on a new connection");
                }
                match authority
                    .join_verified(&document_id, identity, self.connection, resume)
                    .await
                {
                    Ok(_) => {
                        self.joined.insert(document_id);
                    }
                    Err(e) => self.reply_error(Some(document_id), &e),
                }
            }
            other => self.handle_document_message(other, authority).await,
        }
    }

    async fn handle_document_message(&mut self, message: ClientMessage, authority: &Authority) {
        let Some(document_id) = message.document_id().cloned() else {
            return;
        };
        let participant_id = match &self.participant {
            Some(participant_id) if self.joined.contains(&document_id) => participant_id.clone(),
            Some(participant_id) => {
                self.reject(message, SyncError::NotJoined(participant_id.clone()));
                return;
            }
            None => {
                let err = SyncError::Unauthorized("join a document first".into());
                self.reject(message, err);
                return;
            }
        };

        let result = match &message {
            ClientMessage::Leave { .. } => {
                self.joined.remove(&document_id);
                authority.leave(&document_id, &participant_id).await.map(|_| ())
            }
            ClientMessage::Mutate {
                client_seq, mutation, ..
            } => authority
                .publish(&document_id, &participant_id, *client_seq, mutation.clone())
                .await
                .map(|_| ()),
            ClientMessage::Lock { element_id, .. } => authority
                .try_lock(&document_id, element_id, &participant_id)
                .await
                .map(|_| ()),
            ClientMessage::Unlock { element_id, .. } => authority
                .unlock(&document_id, element_id, &participant_id)
                .await
                .map(|_| ()),
            ClientMessage::Cursor { position, .. } => authority
                .update_cursor(&document_id, &participant_id, *position)
                .await
                .map(|_| ()),
            ClientMessage::Join { .. } | ClientMessage::Ping => Ok(()),
        };

        match result {
            Ok(()) => {}
            // Already reported to the participant by the document.
            Err(SyncError::LockDenied { .. }) => {}
            Err(e @ SyncError::NotJoined(_)) => {
                // The document dropped this participant (heartbeat timeout,
                // retirement) without the connection noticing.
                self.joined.remove(&document_id);
                self.reject(message, e);
            }
            Err(e) => {
                warn!(document = %document_id, participant = %participant_id, error = %e, "Operation failed");
                self.reply_error(Some(document_id), &e);
            }
        }
    }

    fn reject(&self, message: ClientMessage, err: SyncError) {
        match message {
            ClientMessage::Mutate {
                document_id,
                client_seq,
                mutation,
            } => self.reply(ServerMessage::MutationRejected {
                document_id,
                element_id: mutation.element_id,
                client_seq,
                code: err.code().to_string(),
                message: err.to_string(),
            }),
            // Cursor updates are lossy.
            ClientMessage::Cursor { .. } => {}
            other => self.reply_error(other.document_id().cloned(), &err),
        }
    }

    async fn close(&mut self, authority: &Authority, hub: &ConnectionHub) {
        let Some(participant_id) = self.participant.take() else {
            return;
        };
        for document_id in std::mem::take(&mut self.joined) {
            match authority
                .disconnect(&document_id, &participant_id, self.connection)
                .await
            {
                Ok(released) if !released.is_empty() => {
                    info!(
                        document = %document_id,
                        participant = %participant_id,
                        released = released.len(),
                        "Released locks of disconnected participant"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(document = %document_id, error = %e, "Disconnect cleanup failed"),
            }
        }
        hub.deregister(&participant_id, self.connection);
    }
}
