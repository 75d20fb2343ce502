//! Subscriber callbacks shared by [`Host`](crate::Host) and
//! [`Peer`](crate::Peer).
//!
//! Callbacks run on the task that produced the event (a connection's
//! receive loop or the peer's supervisor), never while an internal lock is
//! held, so a callback may freely call back into the host or peer that
//! invoked it. Keep them short: a slow callback delays that connection's
//! routing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lanlink_protocol::{Message, Payload, PeerId, RoutingTag};

use crate::LanError;

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Handlers for one event kind, invoked in registration order.
struct CallbackList<A: ?Sized> {
    handlers: Mutex<Vec<Callback<A>>>,
}

impl<A: ?Sized> Default for CallbackList<A> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<A: ?Sized> CallbackList<A> {
    fn lock(&self) -> MutexGuard<'_, Vec<Callback<A>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, handler: Callback<A>) {
        self.lock().push(handler);
    }

    fn emit(&self, arg: &A) {
        // Snapshot so a handler may subscribe more handlers.
        let handlers = self.lock().clone();
        for handler in handlers {
            handler(arg);
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// A message delivered to an `on_receive` subscriber.
///
/// `from_nickname` is resolved against the receiver's own view of the
/// session: the registry on the host, the directory on a peer. It is `None`
/// for messages sent by the host and for senders not (yet) known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub from_id: PeerId,
    pub from_nickname: Option<String>,
    pub to_id: PeerId,
    pub routing_tag: RoutingTag,
    pub app_tag: u8,
    pub payload: Payload,
}

impl Incoming {
    pub(crate) fn new(message: &Message, from_nickname: Option<String>) -> Self {
        Self {
            from_id: message.from_id(),
            from_nickname,
            to_id: message.to_id(),
            routing_tag: message.routing_tag(),
            app_tag: message.app_tag(),
            payload: message.payload(),
        }
    }

    /// The payload as text, if it is text.
    pub fn text(&self) -> Option<&str> {
        self.payload.as_text()
    }

    /// The payload as bytes, if it is binary.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.payload.as_bytes()
    }
}

/// The callback registry behind every `on_*` method.
///
/// Registration takes `&self`, so subscribers can be added before or after
/// the host starts or the peer connects.
#[derive(Default)]
pub struct Subscribers {
    client_connect: CallbackList<str>,
    client_disconnect: CallbackList<str>,
    receive: CallbackList<Incoming>,
    error: CallbackList<LanError>,
    lost_connection: CallbackList<()>,
    reconnection_attempt: CallbackList<u32>,
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("client_connect", &self.client_connect.len())
            .field("client_disconnect", &self.client_disconnect.len())
            .field("receive", &self.receive.len())
            .field("error", &self.error.len())
            .field("lost_connection", &self.lost_connection.len())
            .field("reconnection_attempt", &self.reconnection_attempt.len())
            .finish()
    }
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the nickname of every peer that joins the session.
    pub fn on_client_connect(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.client_connect.subscribe(Arc::new(handler));
    }

    /// Called with the nickname of every peer that leaves the session,
    /// whatever the cause.
    pub fn on_client_disconnect(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.client_disconnect.subscribe(Arc::new(handler));
    }

    /// Called for every application message addressed to this party.
    pub fn on_receive(&self, handler: impl Fn(&Incoming) + Send + Sync + 'static) {
        self.receive.subscribe(Arc::new(handler));
    }

    /// Called for failures that do not surface through a return value.
    pub fn on_error(&self, handler: impl Fn(&LanError) + Send + Sync + 'static) {
        self.error.subscribe(Arc::new(handler));
    }

    /// Peer only: the connection to the host dropped without a call to
    /// `disconnect`.
    pub fn on_lost_connection(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.lost_connection.subscribe(Arc::new(move |_: &()| handler()));
    }

    /// Peer only: a reconnection attempt is starting. The argument counts
    /// attempts since the connection was lost, starting at 1.
    pub fn on_reconnection_attempt(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        self.reconnection_attempt
            .subscribe(Arc::new(move |attempt: &u32| handler(*attempt)));
    }

    pub(crate) fn client_connected(&self, nickname: &str) {
        self.client_connect.emit(nickname);
    }

    pub(crate) fn client_disconnected(&self, nickname: &str) {
        self.client_disconnect.emit(nickname);
    }

    pub(crate) fn received(&self, incoming: &Incoming) {
        self.receive.emit(incoming);
    }

    pub(crate) fn failed(&self, error: &LanError) {
        self.error.emit(error);
    }

    pub(crate) fn connection_lost(&self) {
        self.lost_connection.emit(&());
    }

    pub(crate) fn reconnecting(&self, attempt: u32) {
        self.reconnection_attempt.emit(&attempt);
    }
}
