//! Socket session: one transport plus its frame codec and lifecycle events.
//!
//! The session turns native transport callbacks into events on its own
//! [`EventChannel`]:
//!
//! - [`OPEN`] once the transport is connected
//! - [`MESSAGE`] with the decoded [`Ejson`] frame, never the raw text
//! - [`CLOSE`] when the transport goes away
//! - [`ERROR`] for transport failures and undecodable frames
//!
//! Nothing returns an error across the session boundary; reconnect policy
//! belongs to whoever listens for `close`.

use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::EventChannel;
use crate::ejson::{Codec, CodecError, Ejson};
use crate::proto::Envelope;
use crate::socket::transport::{Transport, TransportError, TransportEvent, TransportSink};

pub const OPEN: &str = "open";
pub const MESSAGE: &str = "message";
pub const CLOSE: &str = "close";
pub const ERROR: &str = "error";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Errors reported through the session's `error` event.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("frame codec: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Debug)]
pub enum SessionEvent {
    Open,
    Message(Ejson),
    Close,
    Error(SessionError),
}

impl SessionEvent {
    /// Channel name the event is emitted under.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Open => OPEN,
            SessionEvent::Message(_) => MESSAGE,
            SessionEvent::Close => CLOSE,
            SessionEvent::Error(_) => ERROR,
        }
    }
}

pub struct Session {
    id: String,
    transport: Box<dyn Transport>,
    codec: Codec,
    status: SessionStatus,
    events: EventChannel<SessionEvent>,
}

impl Session {
    pub fn new(id: impl Into<String>, transport: Box<dyn Transport>, codec: Codec) -> Self {
        Self {
            id: id.into(),
            transport,
            codec,
            status: SessionStatus::Closed,
            events: EventChannel::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Listener registry for this session.
    pub fn events_mut(&mut self) -> &mut EventChannel<SessionEvent> {
        &mut self.events
    }

    /// Opens the transport. A failed open reports `error` followed by `close`.
    pub fn open(&mut self, endpoint: &str, sink: TransportSink) {
        debug!(event = "session_open", session_id = %self.id, endpoint);
        self.status = SessionStatus::Connecting;
        if let Err(err) = self.transport.open(endpoint, sink) {
            self.fail(err.into());
            self.status = SessionStatus::Closed;
            self.emit(SessionEvent::Close);
        }
    }

    /// Encodes `value` into one text frame and writes it.
    pub fn send(&mut self, value: &Ejson) {
        match self.codec.encode(value) {
            Ok(text) => self.write(text),
            Err(err) => self.fail(err.into()),
        }
    }

    /// Writes one DDP message, encoding its payload values with the session
    /// codec.
    pub fn send_envelope(&mut self, envelope: &Envelope) {
        let text = envelope
            .to_wire(&self.codec)
            .and_then(|wire| wire.to_text().map_err(CodecError::from));
        match text {
            Ok(text) => self.write(text),
            Err(err) => self.fail(err.into()),
        }
    }

    pub fn close(&mut self) {
        if self.status == SessionStatus::Closed {
            return;
        }
        self.status = SessionStatus::Closing;
        if let Err(err) = self.transport.close() {
            self.fail(err.into());
        }
    }

    /// Feeds one native transport callback into the session.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.status = SessionStatus::Open;
                self.emit(SessionEvent::Open);
            }
            TransportEvent::Message(text) => match self.codec.decode(&text) {
                Ok(value) => self.emit(SessionEvent::Message(value)),
                Err(err) => {
                    warn!(event = "frame_dropped", session_id = %self.id, error = %err);
                    self.fail(err.into());
                }
            },
            TransportEvent::Close => {
                self.status = SessionStatus::Closed;
                self.emit(SessionEvent::Close);
            }
            TransportEvent::Error(err) => self.fail(err.into()),
        }
    }

    fn write(&mut self, text: String) {
        if let Err(err) = self.transport.send(text) {
            self.fail(err.into());
        }
    }

    fn fail(&mut self, error: SessionError) {
        debug!(event = "session_error", session_id = %self.id, error = %error);
        self.emit(SessionEvent::Error(error));
    }

    fn emit(&mut self, event: SessionEvent) {
        self.events.emit(event.name(), &event);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
