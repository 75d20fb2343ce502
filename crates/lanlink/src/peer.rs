//! `Peer`: one outbound connection to a host, its half of the routing
//! state machine, and reconnection.
//!
//! ```text
//! Disconnected ──connect──→ Connecting ──TCP up──→ Handshaking ──Id──→ Joined
//!      ▲                        │                       │                 │
//!      └──────── connect failed ┘                       └── link lost ────┴──→ retry every interval
//! ```
//!
//! Every `connect` and `disconnect` bumps an epoch. Tasks started for an
//! older epoch notice the change and wind down without touching the peer's
//! state, which makes `disconnect` idempotent and lets it cancel a retry
//! that is already sleeping or dialling.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lanlink_protocol::{CodecConfig, FrameBuffer, Message, Payload, PeerId, RoutingTag, WireCodec};
use lanlink_session::PeerDirectory;
use lanlink_transport::{Connection, Connector, TcpConnector};
use tokio::sync::{mpsc, watch};

use crate::events::{Incoming, Subscribers};
use crate::reconnect::ReconnectState;
use crate::session::write_loop;
use crate::{LanError, PeerConfig, ReconnectConfig};

/// Where a peer is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No connection, and none being attempted right now.
    #[default]
    Disconnected,
    /// Dialling the host.
    Connecting,
    /// Connected; `NicknameAsk` sent, waiting for an id.
    Handshaking,
    /// Id assigned; the peer is part of the session.
    Joined,
}

/// What the peer knows about the current session. Rebuilt from scratch on
/// every connection.
struct Link {
    id: PeerId,
    nickname: String,
    directory: PeerDirectory,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Sent while handshaking; stamped with the id and flushed once it
    /// arrives.
    held: Vec<Message>,
}

/// Why a link's receive loop stopped.
enum LinkEnd {
    Closed,
    Failed(LanError),
    /// `disconnect` or a newer `connect` took over.
    Superseded,
}

/// Something to tell subscribers once the link lock is released.
enum Event {
    Connected(String),
    Disconnected(String),
    Received(Incoming),
}

struct PeerShared {
    config: PeerConfig,
    codec: WireCodec,
    events: Subscribers,
    link: Mutex<Link>,
    state: watch::Sender<PeerState>,
    /// Only changed while holding `link`.
    epoch: watch::Sender<u64>,
}

impl PeerShared {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        *self.epoch.borrow() == epoch
    }

    /// Starts a new epoch, dropping whatever link the old one had.
    fn begin(&self, state: PeerState) -> u64 {
        let mut link = self.link();
        let mut epoch = 0;
        self.epoch.send_modify(|current| {
            *current += 1;
            epoch = *current;
        });
        self.reset(&mut link);
        self.state.send_replace(state);
        epoch
    }

    /// Forgets the session. Dropping the outbound queue lets the writer
    /// flush and close the socket.
    fn reset(&self, link: &mut Link) {
        link.id = PeerId::HOST;
        link.nickname.clone_from(&self.config.nickname);
        link.directory.clear();
        link.outbound = None;
        link.held.clear();
    }

    fn set_state(&self, epoch: u64, state: PeerState) {
        let _link = self.link();
        if self.is_current(epoch) {
            self.state.send_replace(state);
        }
    }

    /// Installs the outbound queue for `conn` and sends `NicknameAsk`.
    fn open_link<C: Connection>(&self, epoch: u64, conn: &Arc<C>) -> Result<(), LanError> {
        let hello = Message::new(RoutingTag::NicknameAsk, PeerId::HOST, PeerId::HOST)
            .with_value(self.config.nickname.as_str());
        let hello = self.codec.encode(&hello)?;

        let (outbound, rx) = mpsc::unbounded_channel();
        {
            let mut link = self.link();
            if !self.is_current(epoch) {
                return Err(LanError::NotConnected);
            }
            outbound
                .send(hello)
                .map_err(|_| LanError::NotConnected)?;
            link.outbound = Some(outbound);
            self.state.send_replace(PeerState::Handshaking);
        }

        tokio::spawn(write_loop(Arc::clone(conn), rx));
        tracing::debug!(conn_id = %conn.id(), nickname = %self.config.nickname, "handshake sent");
        Ok(())
    }

    /// Clears the link after its connection ended. Returns `false` if the
    /// epoch has moved on, in which case nothing was touched.
    fn end_link(&self, epoch: u64) -> bool {
        let mut link = self.link();
        if !self.is_current(epoch) {
            return false;
        }
        self.reset(&mut link);
        self.state.send_replace(PeerState::Disconnected);
        true
    }

    /// Reads and routes until the connection ends or the epoch changes.
    async fn run_link<C: Connection>(&self, epoch: u64, conn: &C) -> LinkEnd {
        let mut epochs = self.epoch.subscribe();
        let mut frames = FrameBuffer::new(self.codec.clone());

        loop {
            let bytes = tokio::select! {
                result = conn.recv() => match result {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return LinkEnd::Closed,
                    Err(e) => return LinkEnd::Failed(e.into()),
                },
                () = superseded(&mut epochs, epoch) => return LinkEnd::Superseded,
            };

            frames.push(&bytes);
            loop {
                match frames.next_message() {
                    Ok(Some(message)) => self.route(epoch, &message),
                    Ok(None) => break,
                    Err(e) => return LinkEnd::Failed(e.into()),
                }
            }
        }
    }

    fn route(&self, epoch: u64, message: &Message) {
        tracing::trace!(
            tag = ?message.routing_tag(),
            from = %message.from_id(),
            to = %message.to_id(),
            "message received"
        );

        let event = {
            let mut link = self.link();
            if !self.is_current(epoch) {
                return;
            }
            self.apply(&mut link, message)
        };

        match event {
            Some(Event::Connected(nickname)) => self.events.client_connected(&nickname),
            Some(Event::Disconnected(nickname)) => self.events.client_disconnected(&nickname),
            Some(Event::Received(incoming)) => self.events.received(&incoming),
            None => {}
        }
    }

    fn apply(&self, link: &mut Link, message: &Message) -> Option<Event> {
        match message.routing_tag() {
            RoutingTag::Id => {
                // Adopted once; later Id messages are not for us.
                if link.id.is_host() && !message.to_id().is_host() {
                    link.id = message.to_id();
                    self.state.send_replace(PeerState::Joined);
                    tracing::info!(peer_id = %link.id, "joined session");
                    self.flush_held(link);
                }
                None
            }
            RoutingTag::Nickname => {
                let id = message.to_id();
                if id.is_host() {
                    tracing::debug!("ignoring nickname for the host id");
                    return None;
                }
                if id == link.id {
                    link.nickname = message.value().to_owned();
                }
                link.directory
                    .upsert(id, message.value())
                    .then(|| Event::Connected(message.value().to_owned()))
            }
            RoutingTag::Disconnect => match message.value().parse::<u8>() {
                Ok(raw) => link.directory.remove(PeerId(raw)).map(Event::Disconnected),
                Err(_) => {
                    tracing::debug!(value = %message.value(), "ignoring malformed disconnect notice");
                    None
                }
            },
            RoutingTag::ServerToAll | RoutingTag::ClientToAll => {
                // Broadcasts echo back to their sender.
                (message.from_id() != link.id).then(|| received(link, message))
            }
            RoutingTag::ServerToClient | RoutingTag::ClientToClient => {
                (message.to_id() == link.id).then(|| received(link, message))
            }
            tag => {
                tracing::debug!(?tag, "ignoring host-bound message");
                None
            }
        }
    }

    /// Sends everything queued during the handshake, now from `link.id`.
    fn flush_held(&self, link: &mut Link) {
        let held = std::mem::take(&mut link.held);
        let Some(outbound) = link.outbound.as_ref() else {
            return;
        };
        for message in held {
            let message = Message::new(message.routing_tag(), link.id, message.to_id())
                .with_app_tag(message.app_tag())
                .with_payload(message.payload());
            match self.codec.encode(&message) {
                Ok(frame) => {
                    if outbound.send(frame).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping held message"),
            }
        }
    }
}

fn received(link: &Link, message: &Message) -> Event {
    let from_nickname = link.directory.nickname(message.from_id()).map(str::to_owned);
    Event::Received(Incoming::new(message, from_nickname))
}

/// Resolves once the epoch is no longer `epoch`.
async fn superseded(epochs: &mut watch::Receiver<u64>, epoch: u64) {
    loop {
        if *epochs.borrow_and_update() != epoch {
            return;
        }
        if epochs.changed().await.is_err() {
            return;
        }
    }
}

/// Owns a connection for its whole life, reconnecting whenever the link
/// drops, until the epoch moves on or the retry budget runs out.
async fn supervise<K: Connector>(
    connector: Arc<K>,
    shared: Arc<PeerShared>,
    epoch: u64,
    addr: String,
    mut conn: Arc<K::Connection>,
) {
    loop {
        let end = shared.run_link(epoch, &*conn).await;
        if matches!(end, LinkEnd::Superseded) || !shared.end_link(epoch) {
            return;
        }

        if let LinkEnd::Failed(e) = end {
            tracing::debug!(%addr, error = %e, "link failed");
            shared.events.failed(&e);
        }
        tracing::warn!(%addr, "lost connection to host");
        shared.events.connection_lost();

        conn = match reconnect(&*connector, &shared, epoch, &addr).await {
            Some(conn) => conn,
            None => return,
        };
        if let Err(e) = shared.open_link(epoch, &conn) {
            tracing::debug!(%addr, error = %e, "dropping reconnected link");
            let _ = conn.close().await;
            return;
        }
    }
}

/// Dials `addr` every interval until it answers, the epoch moves on, or
/// `max_attempts` is spent.
async fn reconnect<K: Connector>(
    connector: &K,
    shared: &PeerShared,
    epoch: u64,
    addr: &str,
) -> Option<Arc<K::Connection>> {
    let mut backoff = ReconnectState::new(shared.config.reconnect.clone());
    let mut epochs = shared.epoch.subscribe();

    loop {
        let Some(delay) = backoff.next_delay() else {
            let attempts = backoff.attempts();
            tracing::warn!(%addr, attempts, "giving up reconnecting");
            shared.events.failed(&LanError::ReconnectExhausted(attempts));
            return None;
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = superseded(&mut epochs, epoch) => return None,
        }
        if !shared.is_current(epoch) {
            return None;
        }

        let attempt = backoff.attempts();
        shared.set_state(epoch, PeerState::Connecting);
        shared.events.reconnecting(attempt);
        tracing::debug!(%addr, attempt, "reconnecting");

        let result = tokio::select! {
            result = connector.connect(addr) => result,
            () = superseded(&mut epochs, epoch) => return None,
        };
        match result {
            Ok(conn) => {
                tracing::info!(%addr, attempt, "reconnected");
                return Some(Arc::new(conn));
            }
            Err(e) => {
                tracing::warn!(%addr, attempt, error = %e, "reconnection attempt failed");
                shared.set_state(epoch, PeerState::Disconnected);
                shared.events.failed(&e.into());
            }
        }
    }
}

/// Builder for a [`Peer`].
///
/// # Example
///
/// ```rust,no_run
/// # async fn run() -> Result<(), lanlink::LanError> {
/// use lanlink::prelude::*;
///
/// let peer = Peer::builder()
///     .nickname("Alice")
///     .on_receive(|msg| println!("{:?}: {:?}", msg.from_nickname, msg.payload))
///     .build();
/// peer.connect("192.168.1.20", 9000).await?;
/// peer.send_to_all("hi", 0)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct PeerBuilder {
    config: PeerConfig,
    events: Subscribers,
}

impl PeerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the nickname requested from the host.
    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.config.nickname = nickname.into();
        self
    }

    /// Replaces the reconnection policy.
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Sets the delay between reconnection attempts.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect.interval = interval;
        self
    }

    /// Gives up reconnecting after `attempts` failures.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = Some(attempts);
        self
    }

    /// Sets the frame compression settings.
    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.config.codec = codec;
        self
    }

    /// Called with the nickname of each newly identified peer.
    pub fn on_client_connect(self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.events.on_client_connect(handler);
        self
    }

    /// Called with the nickname of each identified peer that leaves.
    pub fn on_client_disconnect(self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.events.on_client_disconnect(handler);
        self
    }

    /// Called for every application message delivered here.
    pub fn on_receive(self, handler: impl Fn(&Incoming) + Send + Sync + 'static) -> Self {
        self.events.on_receive(handler);
        self
    }

    /// Called when a connection fails or a frame cannot be decoded.
    pub fn on_error(self, handler: impl Fn(&LanError) + Send + Sync + 'static) -> Self {
        self.events.on_error(handler);
        self
    }

    /// Called when the link to the host drops unexpectedly.
    pub fn on_lost_connection(self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.events.on_lost_connection(handler);
        self
    }

    /// Called with the attempt number before each reconnection dial.
    pub fn on_reconnection_attempt(self, handler: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.events.on_reconnection_attempt(handler);
        self
    }

    /// Builds a peer that connects over TCP.
    pub fn build(self) -> Peer {
        self.build_with(TcpConnector::new())
    }

    /// Builds a peer that connects through `connector`.
    pub fn build_with<K: Connector>(self, connector: K) -> Peer<K> {
        let link = Link {
            id: PeerId::HOST,
            nickname: self.config.nickname.clone(),
            directory: PeerDirectory::new(),
            outbound: None,
            held: Vec::new(),
        };
        let shared = PeerShared {
            codec: WireCodec::new(self.config.codec.clone()),
            config: self.config,
            events: self.events,
            link: Mutex::new(link),
            state: watch::Sender::new(PeerState::Disconnected),
            epoch: watch::Sender::new(0),
        };
        Peer {
            connector: Arc::new(connector),
            shared: Arc::new(shared),
        }
    }
}

/// A game client's connection to a host.
///
/// Dropping the peer disconnects it.
pub struct Peer<K: Connector = TcpConnector> {
    connector: Arc<K>,
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Creates a new builder.
    pub fn builder() -> PeerBuilder {
        PeerBuilder::new()
    }

    /// Creates a TCP peer with default settings and the given nickname.
    pub fn new(nickname: impl Into<String>) -> Self {
        PeerBuilder::new().nickname(nickname).build()
    }
}

impl<K: Connector> Peer<K> {
    /// Connects to the host at `address:port` and starts the handshake.
    ///
    /// Returns once the connection is up and `NicknameAsk` is queued; watch
    /// [`subscribe_state`](Self::subscribe_state) for [`PeerState::Joined`].
    /// Broadcasts and messages to the host sent before then are held until
    /// the id arrives.
    /// If the connection later drops, the peer reconnects on its own until
    /// [`disconnect`](Self::disconnect) is called. Connecting while already
    /// connected replaces the current connection.
    ///
    /// # Errors
    /// The transport error if the first attempt fails. No retry is
    /// scheduled in that case.
    pub async fn connect(&self, address: &str, port: u16) -> Result<(), LanError> {
        let epoch = self.shared.begin(PeerState::Connecting);
        let addr = format!("{address}:{port}");
        tracing::debug!(%addr, "connecting");

        let conn = match self.connector.connect(&addr).await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                self.shared.set_state(epoch, PeerState::Disconnected);
                return Err(e.into());
            }
        };

        if let Err(e) = self.shared.open_link(epoch, &conn) {
            let _ = conn.close().await;
            self.shared.set_state(epoch, PeerState::Disconnected);
            return Err(e);
        }
        tracing::info!(%addr, "connected to host");

        tokio::spawn(supervise(
            Arc::clone(&self.connector),
            Arc::clone(&self.shared),
            epoch,
            addr,
            conn,
        ));
        Ok(())
    }

    /// Closes the connection and stops any reconnection, including one
    /// already in progress. Calling this more than once is harmless.
    pub fn disconnect(&self) {
        let was = *self.shared.state.borrow();
        self.shared.begin(PeerState::Disconnected);
        if was != PeerState::Disconnected {
            tracing::info!("disconnected from host");
        }
    }

    /// Sends `payload` to the host only (`ClientToServer`).
    ///
    /// While the peer is still [`PeerState::Handshaking`] the message is
    /// held and sent as soon as the host assigns an id, so it always goes
    /// out under the peer's real identity.
    ///
    /// # Errors
    /// [`LanError::NotConnected`] if there is no connection.
    pub fn send_to_server(&self, payload: impl Into<Payload>, app_tag: u8) -> Result<(), LanError> {
        self.send(RoutingTag::ClientToServer, None, payload.into(), app_tag)
    }

    /// Sends `payload` to every other peer and the host (`ClientToAll`).
    pub fn send_to_all(&self, payload: impl Into<Payload>, app_tag: u8) -> Result<(), LanError> {
        self.send(RoutingTag::ClientToAll, None, payload.into(), app_tag)
    }

    /// Sends `payload` to the peer called `nickname` (`ClientToClient`).
    /// Sending to one's own nickname is allowed.
    ///
    /// # Errors
    /// [`LanError::NotFound`] if the directory has no such peer, which is
    /// always the case before the peer has joined.
    pub fn send_to_client(
        &self,
        nickname: &str,
        payload: impl Into<Payload>,
        app_tag: u8,
    ) -> Result<(), LanError> {
        self.send(RoutingTag::ClientToClient, Some(nickname), payload.into(), app_tag)
    }

    fn send(
        &self,
        tag: RoutingTag,
        nickname: Option<&str>,
        payload: Payload,
        app_tag: u8,
    ) -> Result<(), LanError> {
        let mut link = self.shared.link();
        if link.outbound.is_none() {
            return Err(LanError::NotConnected);
        }
        let to = match nickname {
            Some(nickname) => link
                .directory
                .id_of(nickname)
                .ok_or_else(|| LanError::NotFound(nickname.to_string()))?,
            None => PeerId::HOST,
        };

        let message = Message::new(tag, link.id, to)
            .with_app_tag(app_tag)
            .with_payload(payload);
        let frame = self.shared.codec.encode(&message)?;
        if link.id.is_host() {
            link.held.push(message);
            return Ok(());
        }
        link.outbound
            .as_ref()
            .ok_or(LanError::NotConnected)?
            .send(frame)
            .map_err(|_| LanError::NotConnected)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> PeerState {
        *self.shared.state.borrow()
    }

    /// A receiver that sees every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<PeerState> {
        self.shared.state.subscribe()
    }

    /// The id assigned by the host, or [`PeerId::HOST`] before joining.
    pub fn local_id(&self) -> PeerId {
        self.shared.link().id
    }

    /// The nickname the host assigned, or the requested one before joining.
    pub fn nickname(&self) -> String {
        self.shared.link().nickname.clone()
    }

    /// Snapshot of the other known peers (and this one, once joined).
    pub fn directory(&self) -> PeerDirectory {
        self.shared.link().directory.clone()
    }

    /// The configuration the peer was built with.
    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    /// The subscriber registry.
    pub fn events(&self) -> &Subscribers {
        &self.shared.events
    }

    /// Adds an `on_client_connect` callback.
    pub fn on_client_connect(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.events.on_client_connect(handler);
    }

    /// Adds an `on_client_disconnect` callback.
    pub fn on_client_disconnect(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.events.on_client_disconnect(handler);
    }

    /// Adds an `on_receive` callback.
    pub fn on_receive(&self, handler: impl Fn(&Incoming) + Send + Sync + 'static) {
        self.shared.events.on_receive(handler);
    }

    /// Adds an `on_error` callback.
    pub fn on_error(&self, handler: impl Fn(&LanError) + Send + Sync + 'static) {
        self.shared.events.on_error(handler);
    }

    /// Adds an `on_lost_connection` callback.
    pub fn on_lost_connection(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.shared.events.on_lost_connection(handler);
    }

    /// Adds an `on_reconnection_attempt` callback.
    pub fn on_reconnection_attempt(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        self.shared.events.on_reconnection_attempt(handler);
    }
}

impl<K: Connector> Drop for Peer<K> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
