//! Transport capability set and the default websocket transport.
//!
//! A [`Transport`] is supplied by the caller and reports its native callbacks
//! (`onopen`, `onmessage`, `onclose`) through a [`TransportSink`]. The sink
//! forwards into a channel drained by the client's single dispatch loop, so a
//! transport may live on any thread.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::retry::{retry_async, with_timeout, RetryPolicy};

/// Native event reported by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close,
    Error(TransportError),
}

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("transport is already open")]
    AlreadyOpen,

    #[error("transport is not open")]
    NotOpen,

    #[error("transport is closed")]
    Closed,

    #[error("no async runtime available to drive the transport")]
    NoRuntime,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Receiving end of every sink created for a client.
pub type TransportEvents = mpsc::UnboundedReceiver<(String, TransportEvent)>;

/// Callback handle given to a transport on open.
#[derive(Clone, Debug)]
pub struct TransportSink {
    socket_id: String,
    tx: mpsc::UnboundedSender<(String, TransportEvent)>,
}

impl TransportSink {
    pub fn new(
        socket_id: impl Into<String>,
        tx: mpsc::UnboundedSender<(String, TransportEvent)>,
    ) -> Self {
        Self {
            socket_id: socket_id.into(),
            tx,
        }
    }

    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn message(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Message(text.into()));
    }

    pub fn close(&self) {
        self.emit(TransportEvent::Close);
    }

    pub fn error(&self, error: TransportError) {
        self.emit(TransportEvent::Error(error));
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver only goes away together with the client.
        let _ = self.tx.send((self.socket_id.clone(), event));
    }
}

/// Bidirectional message transport used by a socket session.
pub trait Transport: Send {
    /// Starts connecting to `endpoint`. Lifecycle and inbound frames are
    /// reported through `sink`.
    fn open(&mut self, endpoint: &str, sink: TransportSink) -> Result<(), TransportError>;

    /// Writes one text frame.
    fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Requests shutdown; the close callback follows through the sink.
    fn close(&mut self) -> Result<(), TransportError>;
}

enum WsCommand {
    Send(String),
    Close,
}

/// Websocket transport backed by `tokio-tungstenite`.
///
/// `open` spawns a worker task on the current tokio runtime which owns the
/// socket. Frames sent before the handshake completes are buffered in order.
#[derive(Debug)]
pub struct WsTransport {
    retry_policy: RetryPolicy,
    commands: Option<mpsc::UnboundedSender<WsCommand>>,
    worker: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::websocket_connect())
    }

    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            commands: None,
            worker: None,
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WsTransport {
    fn open(&mut self, endpoint: &str, sink: TransportSink) -> Result<(), TransportError> {
        if self.commands.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let url = endpoint.trim_end().to_string();
        let policy = self.retry_policy.clone();
        if let Some(previous) = self.worker.take() {
            previous.abort();
        }
        self.worker = Some(runtime.spawn(websocket_worker(url, policy, rx, sink)));
        self.commands = Some(tx);
        Ok(())
    }

    fn send(&mut self, text: String) -> Result<(), TransportError> {
        let commands = self.commands.as_ref().ok_or(TransportError::NotOpen)?;
        commands
            .send(WsCommand::Send(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let commands = self.commands.take().ok_or(TransportError::NotOpen)?;
        commands
            .send(WsCommand::Close)
            .map_err(|_| TransportError::Closed)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

async fn websocket_worker(
    url: String,
    policy: RetryPolicy,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
    sink: TransportSink,
) {
    let connected = retry_async(
        &policy,
        |attempt| {
            let url = url.clone();
            let attempt_timeout = policy.attempt_timeout;
            async move {
                debug!(event = "ws_connect_attempt", attempt, url = %url);
                match with_timeout(attempt_timeout, connect_async(url)).await {
                    Ok(Ok((socket, _))) => Ok(socket),
                    Ok(Err(err)) => Err(TransportError::WebSocket(err)),
                    Err(_) => Err(TransportError::ConnectTimeout),
                }
            }
        },
        is_retryable,
    )
    .await;

    let mut socket = match connected {
        Ok(socket) => socket,
        Err(err) => {
            sink.error(err);
            sink.close();
            return;
        }
    };
    sink.open();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(WsCommand::Send(text)) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            sink.error(TransportError::WebSocket(err));
                            break;
                        }
                    }
                    Some(WsCommand::Close) | None => {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => sink.message(text),
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        sink.error(TransportError::Protocol(
                            "received non-text frame".to_string(),
                        ));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        sink.error(TransportError::WebSocket(err));
                        break;
                    }
                }
            }
        }
    }

    debug!(event = "ws_closed", socket_id = sink.socket_id());
    sink.close();
}

fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::WebSocket(WsError::Url(_)) | TransportError::WebSocket(WsError::Http(_)) => {
            false
        }
        TransportError::WebSocket(_) | TransportError::ConnectTimeout => true,
        _ => false,
    }
}
