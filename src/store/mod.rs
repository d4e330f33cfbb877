//! Synchronous dispatch core.
//!
//! Every state transition is an [`Action`] travelling through an ordered chain
//! of [`Interceptor`]s and finally reduced by the state machines:
//!
//! | Order | Interceptor | Module |
//! |-------|-------------|--------|
//! | 1 | [`AdmissionControl`](admission::AdmissionControl) | priority gate and backlog drain |
//! | 2 | [`FlushScheduler`](flush::FlushScheduler) | debounce / immediate flush |
//! | 3 | [`Resubscribe`](subscriptions::Resubscribe) | replays subscriptions after reconnect |
//! | 4 | [`AuthFlow`](auth::AuthFlow) | login/logout method calls, resume |
//! | 5 | [`Outbound`](outbound::Outbound) | writes admitted actions to the socket |
//!
//! State lives behind `Arc`s that are swapped on change and kept on no-op, so
//! `Arc::ptr_eq` tells a consumer whether anything moved.

pub mod admission;
pub mod auth;
pub mod collections;
pub mod flush;
pub mod outbound;
pub mod queue;
pub mod subscriptions;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ClientConfig, EntityExtractor, IdGenerator};
use crate::ejson::{Codec, Ejson};
use crate::proto::{is_server_id_frame, DdpError, Envelope, Fields};
use crate::socket::session::{Session, SessionEvent, SessionStatus, CLOSE, ERROR, MESSAGE, OPEN};
use crate::socket::transport::{Transport, TransportEvent, TransportSink};

use self::admission::AdmissionControl;
use self::auth::{AuthFlow, AuthTable};
use self::collections::{Collections, Entities, ModelTable};
use self::flush::{FlushScheduler, FlushSlot, FlushTimer};
use self::outbound::Outbound;
use self::queue::QueueTable;
use self::subscriptions::{Resubscribe, SubscriptionTable};

/// Default priority of method calls and subscriptions.
pub const DEFAULT_PRIORITY: i64 = 0;

/// Queue descriptor attached to priority-governed actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMeta {
    pub id: String,
    pub priority: Option<i64>,
    /// Set on actions signalling that a pending item completed.
    pub resolve: bool,
}

impl QueueMeta {
    pub fn priority(&self) -> i64 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    pub socket_id: Option<String>,
    pub queue: Option<QueueMeta>,
}

#[derive(Clone, Debug)]
pub enum ActionKind {
    /// Request to open the socket's transport.
    Connect { endpoint: String },
    /// Request to close the socket's transport.
    Close,
    /// Transport opened.
    Open,
    Connected { session: String },
    /// Transport closed.
    Disconnected,
    Error { message: String },
    Ping { id: Option<String> },
    Pong { id: Option<String> },
    Method { id: String, name: String, params: Vec<Ejson> },
    Subscribe { id: String, name: String, params: Vec<Ejson> },
    Unsubscribe { id: String },
    Result {
        id: String,
        result: Option<Ejson>,
        error: Option<DdpError>,
        /// Secondary collection updates extracted from `result`.
        entities: Entities,
    },
    Updated { methods: Vec<String> },
    Nosub { id: String, error: Option<DdpError> },
    Added { collection: String, id: String, fields: Fields },
    Changed {
        collection: String,
        id: String,
        fields: Fields,
        cleared: Vec<String>,
    },
    Removed { collection: String, id: String },
    Ready { subs: Vec<String> },
    /// Deferred action joining the backlog; wraps the original kind.
    Enqueue(Box<ActionKind>),
    Flush,
    LoginRequest { call_id: String, params: Ejson },
    LogoutRequest { call_id: String },
    LoggedIn {
        user_id: String,
        token: Option<SecretString>,
    },
    LoggedOut,
    ReleaseDataSource { data_source_id: String },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Connect { .. } => "connect",
            ActionKind::Close => "close",
            ActionKind::Open => "open",
            ActionKind::Connected { .. } => "connected",
            ActionKind::Disconnected => "disconnected",
            ActionKind::Error { .. } => "error",
            ActionKind::Ping { .. } => "ping",
            ActionKind::Pong { .. } => "pong",
            ActionKind::Method { .. } => "method",
            ActionKind::Subscribe { .. } => "subscribe",
            ActionKind::Unsubscribe { .. } => "unsubscribe",
            ActionKind::Result { .. } => "result",
            ActionKind::Updated { .. } => "updated",
            ActionKind::Nosub { .. } => "nosub",
            ActionKind::Added { .. } => "added",
            ActionKind::Changed { .. } => "changed",
            ActionKind::Removed { .. } => "removed",
            ActionKind::Ready { .. } => "ready",
            ActionKind::Enqueue(_) => "enqueue",
            ActionKind::Flush => "flush",
            ActionKind::LoginRequest { .. } => "login_request",
            ActionKind::LogoutRequest { .. } => "logout_request",
            ActionKind::LoggedIn { .. } => "logged_in",
            ActionKind::LoggedOut => "logged_out",
            ActionKind::ReleaseDataSource { .. } => "release_data_source",
        }
    }

    /// Call id of an outbound method or subscription.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            ActionKind::Method { id, .. } | ActionKind::Subscribe { id, .. } => Some(id),
            ActionKind::Enqueue(inner) => inner.call_id(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Action {
    pub kind: ActionKind,
    pub meta: Meta,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            meta: Meta::default(),
        }
    }

    pub fn for_socket(mut self, socket_id: impl Into<String>) -> Self {
        self.meta.socket_id = Some(socket_id.into());
        self
    }

    /// Tags the action as governed by queue `queue_id` at `priority`.
    pub fn queued(mut self, queue_id: impl Into<String>, priority: i64) -> Self {
        self.meta.queue = Some(QueueMeta {
            id: queue_id.into(),
            priority: Some(priority),
            resolve: false,
        });
        self
    }

    /// Tags the action as resolving a pending item of queue `queue_id`.
    pub fn resolving(mut self, queue_id: impl Into<String>) -> Self {
        self.meta.queue = Some(QueueMeta {
            id: queue_id.into(),
            priority: None,
            resolve: true,
        });
        self
    }

    pub fn socket_id(&self) -> Option<&str> {
        self.meta.socket_id.as_deref()
    }
}

/// Snapshot of all reduced state.
#[derive(Clone, Debug, Default)]
pub struct State {
    pub queues: Arc<QueueTable>,
    pub collections: Arc<Collections>,
    pub auth: Arc<AuthTable>,
    pub subscriptions: Arc<SubscriptionTable>,
}

/// One link of the dispatch pipeline.
///
/// Implementations forward with [`Chain::next`] (pass-through by default) and
/// may re-enter the whole pipeline with [`Chain::dispatch`]. Interceptors are
/// stateless; mutable resources are reached through the chain.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, action: Action, chain: &mut Chain<'_>);
}

/// Cursor into the pipeline handed to an interceptor.
pub struct Chain<'a> {
    store: &'a mut Store,
    index: usize,
}

impl Chain<'_> {
    /// Continues with the next interceptor, or reduces at the end.
    pub fn next(&mut self, action: Action) {
        self.store.run(self.index + 1, action);
    }

    /// Runs `action` through the whole pipeline before returning.
    pub fn dispatch(&mut self, action: Action) {
        self.store.run(0, action);
    }

    pub fn state(&self) -> &State {
        &self.store.state
    }

    pub fn generate_id(&mut self) -> String {
        (self.store.id_generator)()
    }

    pub(crate) fn arm_flush(&mut self) {
        self.store.flush.arm();
    }

    pub(crate) fn cancel_flush(&mut self) {
        self.store.flush.cancel();
    }

    /// Writes an envelope to the socket; unknown sockets are logged and
    /// skipped.
    pub(crate) fn send(&mut self, socket_id: &str, envelope: &Envelope) {
        match self.store.sessions.get_mut(socket_id) {
            Some(session) => session.send_envelope(envelope),
            None => warn!(
                event = "send_without_session",
                socket_id,
                kind = envelope.kind()
            ),
        }
    }

    pub(crate) fn open_session(&mut self, socket_id: &str, endpoint: &str) {
        let sink = TransportSink::new(socket_id, self.store.transport_tx.clone());
        if let Some(session) = self.store.sessions.get_mut(socket_id) {
            session.open(endpoint, sink);
        }
    }

    pub(crate) fn close_session(&mut self, socket_id: &str) {
        if let Some(session) = self.store.sessions.get_mut(socket_id) {
            session.close();
        }
    }

    /// DDP session id of the socket's previous connection.
    pub(crate) fn last_session(&self, socket_id: &str) -> Option<String> {
        self.store.last_sessions.get(socket_id).cloned()
    }

    pub(crate) fn resume_token(&self, socket_id: &str) -> Option<SecretString> {
        self.store.resume_tokens.get(socket_id).cloned()
    }

    pub(crate) fn set_resume_token(&mut self, socket_id: &str, token: SecretString) {
        self.store.resume_tokens.insert(socket_id.to_string(), token);
    }

    pub(crate) fn forget_resume_token(&mut self, socket_id: &str) {
        self.store.resume_tokens.remove(socket_id);
    }
}

/// Misuse of the store API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("socket {0} is not registered")]
    UnknownSocket(String),

    #[error("socket {0} is still open")]
    SocketInUse(String),
}

/// Options for an outbound method call or subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOptions {
    pub priority: i64,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl CallOptions {
    pub fn with_priority(priority: i64) -> Self {
        Self { priority }
    }
}

/// Session event flattened for the store's inbox.
#[derive(Debug)]
enum SocketSignal {
    Open,
    Message(Ejson),
    Close,
    Error(String),
}

impl From<&SessionEvent> for SocketSignal {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Open => SocketSignal::Open,
            SessionEvent::Message(value) => SocketSignal::Message(value.clone()),
            SessionEvent::Close => SocketSignal::Close,
            SessionEvent::Error(err) => SocketSignal::Error(err.to_string()),
        }
    }
}

/// Owner of every session, the reduced state and the flush timer.
///
/// All methods run synchronously on the caller's thread; see
/// [`DdpClient`](crate::client::DdpClient) for the async driver.
pub struct Store {
    state: State,
    chain: Arc<[Arc<dyn Interceptor>]>,
    sessions: HashMap<String, Session>,
    codec: Codec,
    models: ModelTable,
    entity_extractor: Option<EntityExtractor>,
    id_generator: IdGenerator,
    flush: FlushSlot,
    transport_tx: mpsc::UnboundedSender<(String, TransportEvent)>,
    signals_tx: mpsc::UnboundedSender<(String, SocketSignal)>,
    signals_rx: mpsc::UnboundedReceiver<(String, SocketSignal)>,
    last_sessions: HashMap<String, String>,
    resume_tokens: HashMap<String, SecretString>,
    dispatched: VecDeque<Action>,
}

impl Store {
    /// Builds a store. Transports opened by this store report into
    /// `transport_tx`; feed the receiving end back through
    /// [`Store::handle_transport_event`].
    pub fn new(
        config: ClientConfig,
        timer: Box<dyn FlushTimer>,
        transport_tx: mpsc::UnboundedSender<(String, TransportEvent)>,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(AdmissionControl),
            Arc::new(FlushScheduler),
            Arc::new(Resubscribe),
            Arc::new(AuthFlow),
            Arc::new(Outbound),
        ];

        Self {
            state: State::default(),
            chain: chain.into(),
            sessions: HashMap::new(),
            codec: Codec::new(Arc::new(config.registry)),
            models: config.models,
            entity_extractor: config.entity_extractor,
            id_generator: config.id_generator,
            flush: FlushSlot::new(timer, config.flush_interval),
            transport_tx,
            signals_tx,
            signals_rx,
            last_sessions: HashMap::new(),
            resume_tokens: HashMap::new(),
            dispatched: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn session_status(&self, socket_id: &str) -> Option<SessionStatus> {
        self.sessions.get(socket_id).map(Session::status)
    }

    /// Pops the oldest reduced action.
    pub fn take_dispatched(&mut self) -> Option<Action> {
        self.dispatched.pop_front()
    }

    pub fn generate_id(&mut self) -> String {
        (self.id_generator)()
    }

    /// Runs one top-level dispatch, then processes session events it caused.
    pub fn dispatch(&mut self, action: Action) {
        self.run(0, action);
        self.drain_signals();
    }

    /// Registers a socket over `transport` and starts connecting it.
    ///
    /// A socket that exists but is closed is replaced; its backlog survives.
    pub fn open_socket(
        &mut self,
        socket_id: impl Into<String>,
        endpoint: &str,
        transport: Box<dyn Transport>,
    ) -> Result<(), StoreError> {
        let socket_id = socket_id.into();
        if let Some(existing) = self.sessions.get(&socket_id) {
            if existing.status() != SessionStatus::Closed {
                return Err(StoreError::SocketInUse(socket_id));
            }
        }

        let mut session = Session::new(socket_id.clone(), transport, self.codec.clone());
        for name in [OPEN, MESSAGE, CLOSE, ERROR] {
            let tx = self.signals_tx.clone();
            let socket = socket_id.clone();
            session.events_mut().on(name, move |event: &SessionEvent| {
                let _ = tx.send((socket.clone(), SocketSignal::from(event)));
            });
        }
        self.sessions.insert(socket_id.clone(), session);

        self.dispatch(
            Action::new(ActionKind::Connect {
                endpoint: endpoint.to_string(),
            })
            .for_socket(socket_id),
        );
        Ok(())
    }

    pub fn close_socket(&mut self, socket_id: &str) -> Result<(), StoreError> {
        self.ensure_socket(socket_id)?;
        self.dispatch(Action::new(ActionKind::Close).for_socket(socket_id));
        Ok(())
    }

    /// Issues a method call and returns its id.
    pub fn call(
        &mut self,
        socket_id: &str,
        method: impl Into<String>,
        params: Vec<Ejson>,
        options: CallOptions,
    ) -> Result<String, StoreError> {
        self.ensure_socket(socket_id)?;
        let id = self.generate_id();
        self.dispatch(
            Action::new(ActionKind::Method {
                id: id.clone(),
                name: method.into(),
                params,
            })
            .for_socket(socket_id)
            .queued(socket_id, options.priority),
        );
        Ok(id)
    }

    /// Subscribes to a publication and returns the subscription id.
    pub fn subscribe(
        &mut self,
        socket_id: &str,
        name: impl Into<String>,
        params: Vec<Ejson>,
        options: CallOptions,
    ) -> Result<String, StoreError> {
        self.ensure_socket(socket_id)?;
        let id = self.generate_id();
        self.dispatch(
            Action::new(ActionKind::Subscribe {
                id: id.clone(),
                name: name.into(),
                params,
            })
            .for_socket(socket_id)
            .queued(socket_id, options.priority),
        );
        Ok(id)
    }

    pub fn unsubscribe(&mut self, socket_id: &str, sub_id: &str) -> Result<(), StoreError> {
        self.ensure_socket(socket_id)?;
        self.dispatch(
            Action::new(ActionKind::Unsubscribe {
                id: sub_id.to_string(),
            })
            .for_socket(socket_id),
        );
        Ok(())
    }

    /// Starts a login with method parameters such as
    /// `{"user": {...}, "password": ...}` and returns the call id.
    pub fn login(&mut self, socket_id: &str, params: Ejson) -> Result<String, StoreError> {
        self.ensure_socket(socket_id)?;
        let call_id = self.generate_id();
        self.dispatch(
            Action::new(ActionKind::LoginRequest {
                call_id: call_id.clone(),
                params,
            })
            .for_socket(socket_id),
        );
        Ok(call_id)
    }

    pub fn logout(&mut self, socket_id: &str) -> Result<String, StoreError> {
        self.ensure_socket(socket_id)?;
        let call_id = self.generate_id();
        self.dispatch(
            Action::new(ActionKind::LogoutRequest {
                call_id: call_id.clone(),
            })
            .for_socket(socket_id),
        );
        Ok(call_id)
    }

    /// Drops every document contribution made by `data_source_id`.
    pub fn release(&mut self, data_source_id: impl Into<String>) {
        self.dispatch(Action::new(ActionKind::ReleaseDataSource {
            data_source_id: data_source_id.into(),
        }));
    }

    /// Feeds a native transport callback for `socket_id`.
    pub fn handle_transport_event(&mut self, socket_id: &str, event: TransportEvent) {
        match self.sessions.get_mut(socket_id) {
            Some(session) => session.handle_transport_event(event),
            None => debug!(event = "transport_event_without_session", socket_id),
        }
        self.drain_signals();
    }

    /// Called when the flush timer armed with `token` expires.
    pub fn fire_flush_timer(&mut self, token: u64) {
        if self.flush.expire(token) && self.state.collections.needs_update() {
            self.dispatch(Action::new(ActionKind::Flush));
        }
    }

    fn ensure_socket(&self, socket_id: &str) -> Result<(), StoreError> {
        if self.sessions.contains_key(socket_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownSocket(socket_id.to_string()))
        }
    }

    fn run(&mut self, index: usize, action: Action) {
        match self.chain.get(index).cloned() {
            Some(interceptor) => {
                let mut chain = Chain { store: self, index };
                interceptor.intercept(action, &mut chain);
            }
            None => self.reduce(action),
        }
    }

    fn reduce(&mut self, action: Action) {
        debug!(
            event = "action_reduced",
            kind = action.kind.name(),
            socket_id = action.socket_id().unwrap_or_default()
        );
        self.state.queues = QueueTable::handle(&self.state.queues, &action);
        self.state.collections =
            Collections::handle(&self.state.collections, &action, &self.models);
        self.state.auth = AuthTable::handle(&self.state.auth, &action);
        self.state.subscriptions = SubscriptionTable::handle(&self.state.subscriptions, &action);
        self.dispatched.push_back(action);
    }

    fn drain_signals(&mut self) {
        while let Ok((socket_id, signal)) = self.signals_rx.try_recv() {
            self.handle_signal(&socket_id, signal);
        }
    }

    fn handle_signal(&mut self, socket_id: &str, signal: SocketSignal) {
        let action = match signal {
            SocketSignal::Open => Action::new(ActionKind::Open),
            SocketSignal::Close => Action::new(ActionKind::Disconnected),
            SocketSignal::Error(message) => Action::new(ActionKind::Error { message }),
            SocketSignal::Message(value) if is_server_id_frame(&value) => {
                debug!(event = "server_id_frame", socket_id);
                return;
            }
            SocketSignal::Message(value) => match Envelope::from_ejson(&value, &self.codec) {
                Ok(envelope) => return self.handle_envelope(socket_id, envelope),
                Err(err) => {
                    warn!(event = "protocol_error", socket_id, error = %err);
                    Action::new(ActionKind::Error {
                        message: err.to_string(),
                    })
                }
            },
        };
        self.run(0, action.for_socket(socket_id));
    }

    fn handle_envelope(&mut self, socket_id: &str, envelope: Envelope) {
        let action = match envelope {
            Envelope::Connected { session } => {
                self.last_sessions
                    .insert(socket_id.to_string(), session.clone());
                Action::new(ActionKind::Connected { session }).resolving(socket_id)
            }
            Envelope::Failed { version } => Action::new(ActionKind::Error {
                message: format!("server requires protocol version {version}"),
            }),
            Envelope::Ping { id } => Action::new(ActionKind::Ping { id }),
            Envelope::Pong { id } => Action::new(ActionKind::Pong { id }),
            Envelope::Result { id, result, error } => {
                let entities = match (&result, &error, &self.entity_extractor) {
                    (Some(result), None, Some(extract)) => extract(result),
                    _ => Entities::new(),
                };
                Action::new(ActionKind::Result {
                    id,
                    result,
                    error,
                    entities,
                })
                .resolving(socket_id)
            }
            Envelope::Updated { methods } => Action::new(ActionKind::Updated { methods }),
            Envelope::Nosub { id, error } => {
                Action::new(ActionKind::Nosub { id, error }).resolving(socket_id)
            }
            Envelope::Added {
                collection,
                id,
                fields,
            } => Action::new(ActionKind::Added {
                collection,
                id,
                fields,
            }),
            Envelope::Changed {
                collection,
                id,
                fields,
                cleared,
            } => Action::new(ActionKind::Changed {
                collection,
                id,
                fields,
                cleared,
            }),
            Envelope::Removed { collection, id } => {
                Action::new(ActionKind::Removed { collection, id })
            }
            Envelope::Ready { subs } => Action::new(ActionKind::Ready { subs }).resolving(socket_id),
            Envelope::Error {
                reason,
                offending_message,
            } => {
                warn!(event = "server_error", socket_id, reason = %reason, offending = ?offending_message);
                Action::new(ActionKind::Error { message: reason })
            }
            other => Action::new(ActionKind::Error {
                message: format!("unexpected {} message from server", other.kind()),
            }),
        };
        self.run(0, action.for_socket(socket_id));
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.state)
            .field("sessions", &self.sessions)
            .field("flush", &self.flush)
            .field("pending_dispatched", &self.dispatched.len())
            .finish_non_exhaustive()
    }
}
