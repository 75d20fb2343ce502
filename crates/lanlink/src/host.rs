//! `Host` builder and accept loop.
//!
//! The host is the hub of a LAN session. It listens for peers, gives each
//! one an identity, and relays traffic between them. It ties together the
//! layers: transport → protocol → session → routing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lanlink_protocol::{CodecConfig, Message, Payload, PeerId, RoutingTag, WireCodec};
use lanlink_session::{IdentityRegistry, PeerDirectory};
use lanlink_transport::{Connection, ConnectionId, TcpTransport, Transport, TransportError};
use tokio::sync::watch;

use crate::events::{Incoming, Subscribers};
use crate::handler::{encode, handle_connection};
use crate::session::{Frame, Session};
use crate::{HostConfig, LanError};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Live connections and the identities assigned to them.
///
/// Both are only ever touched together, under one lock.
pub(crate) struct HostTables {
    pub(crate) sessions: HashMap<ConnectionId, Session>,
    pub(crate) registry: IdentityRegistry,
}

impl HostTables {
    /// Queues `frame` on every live session.
    pub(crate) fn broadcast(&self, frame: &Frame) {
        for session in self.sessions.values() {
            if !session.push(Arc::clone(frame)) {
                tracing::debug!(conn_id = %session.id(), "skipping closing session");
            }
        }
    }

    pub(crate) fn is_identified(&self, conn_id: ConnectionId) -> bool {
        self.sessions
            .get(&conn_id)
            .is_some_and(Session::is_identified)
    }
}

/// Shared host state passed to each connection handler task.
pub(crate) struct HostState {
    tables: Mutex<HostTables>,
    pub(crate) codec: WireCodec,
    pub(crate) events: Subscribers,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl HostState {
    pub(crate) fn tables(&self) -> MutexGuard<'_, HostTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for configuring and starting a [`Host`].
///
/// # Example
///
/// ```rust,no_run
/// # async fn run() -> Result<(), lanlink::LanError> {
/// use lanlink::prelude::*;
///
/// let host = Host::builder()
///     .max_peers(8)
///     .on_client_connect(|nick| println!("{nick} joined"))
///     .on_receive(|msg| println!("{:?}: {:?}", msg.from_nickname, msg.payload))
///     .start(9000)
///     .await?;
/// host.send_to_all("welcome", 0)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct HostBuilder {
    config: HostConfig,
    events: Subscribers,
}

impl HostBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the interface to listen on.
    pub fn bind_address(mut self, addr: &str) -> Self {
        self.config.bind_address = addr.to_string();
        self
    }

    /// Caps the number of simultaneously identified peers.
    pub fn max_peers(mut self, max_peers: u8) -> Self {
        self.config.max_peers = max_peers;
        self
    }

    /// Closes connections that stay silent for `timeout`.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
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

    /// Binds a TCP listener on `bind_address:port` and starts accepting.
    /// Port 0 picks a free port; see [`Host::local_addr`].
    pub async fn start(self, port: u16) -> Result<Host, LanError> {
        let addr = format!("{}:{port}", self.config.bind_address);
        let transport = TcpTransport::bind(&addr).await?;
        Ok(self.start_with(transport))
    }

    /// Starts accepting on an already bound transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_with<T: Transport>(self, transport: T) -> Host<T> {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let state = Arc::new(HostState {
            tables: Mutex::new(HostTables {
                sessions: HashMap::new(),
                registry: IdentityRegistry::with_max_peers(self.config.max_peers),
            }),
            codec: WireCodec::new(self.config.codec.clone()),
            events: self.events,
            idle_timeout: self.config.idle_timeout,
            shutdown: shutdown_rx.clone(),
        });

        let transport = Arc::new(transport);
        match transport.local_addr() {
            Ok(addr) => tracing::info!(%addr, "host listening"),
            Err(e) => tracing::debug!(error = %e, "host listening on unknown address"),
        }

        tokio::spawn(accept_loop(
            Arc::clone(&transport),
            Arc::clone(&state),
            shutdown_rx,
        ));

        Host {
            transport,
            state,
            shutdown,
            config: self.config,
        }
    }
}

/// A running host.
///
/// Dropping the host stops it.
pub struct Host<T: Transport = TcpTransport> {
    transport: Arc<T>,
    state: Arc<HostState>,
    shutdown: watch::Sender<bool>,
    config: HostConfig,
}

impl Host {
    /// Creates a new builder.
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Starts a host with default settings on `port`.
    pub async fn start(port: u16) -> Result<Self, LanError> {
        HostBuilder::new().start(port).await
    }
}

impl<T: Transport> Host<T> {
    /// Returns the local address the host is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// The configuration the host was started with.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// `false` once [`stop`](Self::stop) has been called.
    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Stops accepting and closes every connection. Identified peers are
    /// reported through `on_client_disconnect` as their connections wind
    /// down. Calling this more than once is harmless.
    pub fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.transport.shutdown();
        tracing::info!("host stopping");
    }

    /// Snapshot of the identified peers.
    pub fn peers(&self) -> PeerDirectory {
        let mut directory = PeerDirectory::new();
        for identity in self.state.tables().registry.identities() {
            directory.upsert(identity.id, identity.nickname);
        }
        directory
    }

    /// Sends `payload` to every connected peer (`ServerToAll`).
    pub fn send_to_all(&self, payload: impl Into<Payload>, app_tag: u8) -> Result<(), LanError> {
        self.ensure_running()?;
        let message = Message::new(RoutingTag::ServerToAll, PeerId::HOST, PeerId::HOST)
            .with_app_tag(app_tag)
            .with_payload(payload.into());
        let frame = encode(&self.state.codec, &message)?;
        self.state.tables().broadcast(&frame);
        Ok(())
    }

    /// Sends `payload` to the peer called `nickname` (`ServerToClient`).
    ///
    /// # Errors
    /// [`LanError::NotFound`] if no identified peer has that nickname.
    pub fn send_to_client(
        &self,
        nickname: &str,
        payload: impl Into<Payload>,
        app_tag: u8,
    ) -> Result<(), LanError> {
        self.ensure_running()?;
        let tables = self.state.tables();
        let target = tables
            .registry
            .identities()
            .into_iter()
            .find(|identity| identity.nickname == nickname)
            .ok_or_else(|| LanError::NotFound(nickname.to_string()))?;

        let message = Message::new(RoutingTag::ServerToClient, PeerId::HOST, target.id)
            .with_app_tag(app_tag)
            .with_payload(payload.into());
        let frame = encode(&self.state.codec, &message)?;
        if let Some(session) = tables.sessions.get(&target.connection) {
            session.push(frame);
        }
        Ok(())
    }

    /// The subscriber registry, for adding callbacks after start.
    pub fn events(&self) -> &Subscribers {
        &self.state.events
    }

    /// Adds an `on_client_connect` callback.
    pub fn on_client_connect(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.state.events.on_client_connect(handler);
    }

    /// Adds an `on_client_disconnect` callback.
    pub fn on_client_disconnect(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.state.events.on_client_disconnect(handler);
    }

    /// Adds an `on_receive` callback.
    pub fn on_receive(&self, handler: impl Fn(&Incoming) + Send + Sync + 'static) {
        self.state.events.on_receive(handler);
    }

    /// Adds an `on_error` callback.
    pub fn on_error(&self, handler: impl Fn(&LanError) + Send + Sync + 'static) {
        self.state.events.on_error(handler);
    }

    fn ensure_running(&self) -> Result<(), LanError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(LanError::NotRunning)
        }
    }
}

impl<T: Transport> Drop for Host<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accepts connections until the host stops, spawning a handler task for
/// each one.
async fn accept_loop<T: Transport>(
    transport: Arc<T>,
    state: Arc<HostState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            result = transport.accept() => result,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok(conn) => {
                let conn = Arc::new(conn);
                state
                    .tables()
                    .sessions
                    .insert(conn.id(), Session::spawn(Arc::clone(&conn)));
                tokio::spawn(handle_connection(conn, Arc::clone(&state)));
            }
            Err(TransportError::Shutdown) => break,
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                state.events.failed(&e.into());
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    transport.shutdown();
    tracing::debug!("accept loop finished");
}
