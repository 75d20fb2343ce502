//! Per-connection handler: frame reassembly, identity handshake and routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive bytes → cut them into messages with a `FrameBuffer`
//!   2. `NicknameAsk` → assign an identity, announce it, back-fill the
//!      newcomer's directory
//!   3. Application traffic → relay to every session and/or deliver locally
//!   4. On close, for whatever reason → release the identity and tell the
//!      remaining peers
//!
//! Routing is synchronous. It runs under the tables lock and only ever
//! pushes onto session queues, so one connection's traffic cannot stall
//! another's.

use std::sync::Arc;
use std::time::Duration;

use lanlink_protocol::{FrameBuffer, Message, PeerId, ProtocolError, RoutingTag, WireCodec};
use lanlink_session::{Identity, SessionError};
use lanlink_transport::{Connection, ConnectionId, TransportError};

use crate::events::Incoming;
use crate::host::{HostState, HostTables};
use crate::session::{Frame, SessionState};
use crate::LanError;

/// Why a connection's receive loop stopped.
#[derive(Debug)]
enum SessionEnd {
    /// The remote side closed the stream.
    Closed,
    /// The host is stopping.
    Shutdown,
    /// Transport failure, corrupt frame, idle timeout or rejected handshake.
    Failed(LanError),
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<C: Connection>(conn: Arc<C>, state: Arc<HostState>) {
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let mut shutdown = state.shutdown.clone();
    let mut frames = FrameBuffer::new(state.codec.clone());

    let end = if *shutdown.borrow_and_update() {
        SessionEnd::Shutdown
    } else {
        loop {
            let bytes = tokio::select! {
                result = conn.recv() => match result {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break SessionEnd::Closed,
                    Err(e) => break SessionEnd::Failed(e.into()),
                },
                () = idle(state.idle_timeout) => {
                    break SessionEnd::Failed(TransportError::TimedOut.into());
                }
                _ = shutdown.changed() => break SessionEnd::Shutdown,
            };

            frames.push(&bytes);
            if let Err(end) = drain_frames(&state, conn_id, &mut frames) {
                break end;
            }
        }
    };

    close_session(&state, conn_id, end);
}

/// Resolves after `timeout`, or never when there is none. Recreated on
/// every read, so any received bytes reset it.
async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Routes every complete message in `frames`. A corrupt frame is fatal:
/// the stream cannot be resynchronised.
fn drain_frames(
    state: &HostState,
    conn_id: ConnectionId,
    frames: &mut FrameBuffer,
) -> Result<(), SessionEnd> {
    loop {
        match frames.next_message() {
            Ok(Some(message)) => route(state, conn_id, &message)?,
            Ok(None) => return Ok(()),
            Err(e) => return Err(SessionEnd::Failed(e.into())),
        }
    }
}

fn route(state: &HostState, conn_id: ConnectionId, message: &Message) -> Result<(), SessionEnd> {
    tracing::trace!(
        %conn_id,
        tag = ?message.routing_tag(),
        from = %message.from_id(),
        to = %message.to_id(),
        "message received"
    );

    match message.routing_tag() {
        RoutingTag::NicknameAsk => identify(state, conn_id, message.value()),
        RoutingTag::ClientToServer => {
            deliver(state, conn_id, message, false);
            Ok(())
        }
        RoutingTag::ClientToAll | RoutingTag::ClientToClient => {
            deliver(state, conn_id, message, true);
            Ok(())
        }
        tag => {
            tracing::debug!(%conn_id, ?tag, "ignoring host-to-peer message sent by a peer");
            Ok(())
        }
    }
}

/// Handles `NicknameAsk`: assign, then in order send `Id` to the newcomer,
/// broadcast its `Nickname`, and back-fill the newcomer with everyone else.
fn identify(state: &HostState, conn_id: ConnectionId, requested: &str) -> Result<(), SessionEnd> {
    let mut tables = state.tables();

    let identity = match tables.registry.assign(conn_id, requested) {
        Ok(identity) => identity,
        Err(SessionError::AlreadyIdentified(_)) => {
            tracing::debug!(%conn_id, "ignoring repeated NicknameAsk");
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(%conn_id, error = %e, "rejecting handshake");
            return Err(SessionEnd::Failed(e.into()));
        }
    };

    if let Err(e) = announce(&mut tables, &state.codec, &identity) {
        tables.registry.release_connection(conn_id);
        return Err(SessionEnd::Failed(e.into()));
    }
    drop(tables);

    state.events.client_connected(&identity.nickname);
    Ok(())
}

fn announce(
    tables: &mut HostTables,
    codec: &WireCodec,
    identity: &Identity,
) -> Result<(), ProtocolError> {
    let id_frame = encode(codec, &Message::new(RoutingTag::Id, PeerId::HOST, identity.id))?;
    let nickname_frame = encode(codec, &nickname_message(identity))?;
    let backfill = tables
        .registry
        .identities()
        .iter()
        .filter(|other| other.id != identity.id)
        .map(|other| encode(codec, &nickname_message(other)))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(session) = tables.sessions.get_mut(&identity.connection) {
        session.state = SessionState::Identified;
        session.push(id_frame);
    }
    tables.broadcast(&nickname_frame);
    if let Some(session) = tables.sessions.get(&identity.connection) {
        for frame in backfill {
            session.push(frame);
        }
    }
    Ok(())
}

/// Relays (if asked) and hands the message to local subscribers. Traffic
/// from connections that have not finished the handshake is dropped.
fn deliver(state: &HostState, conn_id: ConnectionId, message: &Message, relay: bool) {
    let mut relay_error = None;

    let from_nickname = {
        let tables = state.tables();
        if !tables.is_identified(conn_id) {
            tracing::debug!(%conn_id, "ignoring message from unidentified connection");
            return;
        }
        if relay {
            match encode(&state.codec, message) {
                Ok(frame) => tables.broadcast(&frame),
                Err(e) => relay_error = Some(e),
            }
        }
        tables
            .registry
            .nickname_of(message.from_id())
            .map(str::to_owned)
    };

    if let Some(e) = relay_error {
        tracing::debug!(%conn_id, error = %e, "relay failed");
        state.events.failed(&e.into());
    }
    state.events.received(&Incoming::new(message, from_nickname));
}

/// Runs once per connection, whatever ended it.
fn close_session(state: &HostState, conn_id: ConnectionId, end: SessionEnd) {
    let shutting_down = *state.shutdown.borrow();

    let departed = {
        let mut tables = state.tables();
        // Dropping the session lets its writer flush and close the socket.
        tables.sessions.remove(&conn_id);
        let departed = tables.registry.release_connection(conn_id);
        if let Some(identity) = &departed {
            if !shutting_down {
                let notice = Message::new(RoutingTag::Disconnect, PeerId::HOST, identity.id)
                    .with_value(identity.id.0.to_string());
                match encode(&state.codec, &notice) {
                    Ok(frame) => tables.broadcast(&frame),
                    Err(e) => tracing::debug!(%conn_id, error = %e, "disconnect notice failed"),
                }
            }
        }
        departed
    };

    match end {
        SessionEnd::Closed => tracing::debug!(%conn_id, "connection closed cleanly"),
        SessionEnd::Shutdown => tracing::debug!(%conn_id, "connection closed by host shutdown"),
        SessionEnd::Failed(e) => {
            tracing::debug!(%conn_id, error = %e, "connection ended with error");
            state.events.failed(&e);
        }
    }

    if let Some(identity) = departed {
        tracing::info!(%conn_id, peer_id = %identity.id, nickname = %identity.nickname, "peer left");
        state.events.client_disconnected(&identity.nickname);
    }
}

fn nickname_message(identity: &Identity) -> Message {
    Message::new(RoutingTag::Nickname, PeerId::HOST, identity.id).with_value(identity.nickname.as_str())
}

pub(crate) fn encode(codec: &WireCodec, message: &Message) -> Result<Frame, ProtocolError> {
    codec.encode(message).map(Frame::from)
}
