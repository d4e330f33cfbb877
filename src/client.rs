//! Async driver around [`Store`].
//!
//! The store itself is synchronous. [`DdpClient`] owns it together with the
//! receiving ends of the transport and flush-timer channels, and feeds both
//! back into the store from whichever task polls [`DdpClient::recv`].

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ClientConfig;
use crate::ejson::Ejson;
use crate::retry::RetryPolicy;
use crate::socket::transport::{Transport, TransportEvents, WsTransport};
use crate::store::flush::TokioFlushTimer;
use crate::store::{Action, CallOptions, State, Store, StoreError};

pub struct DdpClient {
    store: Store,
    transport_rx: TransportEvents,
    flush_rx: mpsc::UnboundedReceiver<u64>,
    connect_retry: RetryPolicy,
}

impl DdpClient {
    pub fn new(config: ClientConfig) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let connect_retry = config.connect_retry.clone();
        let store = Store::new(config, Box::new(TokioFlushTimer::new(flush_tx)), transport_tx);

        Self {
            store,
            transport_rx,
            flush_rx,
            connect_retry,
        }
    }

    /// Opens `socket_id` over a websocket to `endpoint`, e.g.
    /// `ws://localhost:3000/websocket`.
    ///
    /// Must be called inside a tokio runtime; without one the socket reports
    /// an error and closes.
    pub fn connect(&mut self, socket_id: &str, endpoint: &str) -> Result<(), StoreError> {
        let transport = WsTransport::with_retry_policy(self.connect_retry.clone());
        self.open_socket(socket_id, endpoint, Box::new(transport))
    }

    /// Opens `socket_id` over a caller-supplied transport.
    pub fn open_socket(
        &mut self,
        socket_id: &str,
        endpoint: &str,
        transport: Box<dyn Transport>,
    ) -> Result<(), StoreError> {
        debug!(event = "socket_connect", socket_id, endpoint);
        self.store.open_socket(socket_id, endpoint, transport)
    }

    pub fn close(&mut self, socket_id: &str) -> Result<(), StoreError> {
        self.store.close_socket(socket_id)
    }

    pub fn call(
        &mut self,
        socket_id: &str,
        method: impl Into<String>,
        params: Vec<Ejson>,
    ) -> Result<String, StoreError> {
        self.store
            .call(socket_id, method, params, CallOptions::default())
    }

    pub fn call_with_options(
        &mut self,
        socket_id: &str,
        method: impl Into<String>,
        params: Vec<Ejson>,
        options: CallOptions,
    ) -> Result<String, StoreError> {
        self.store.call(socket_id, method, params, options)
    }

    pub fn subscribe(
        &mut self,
        socket_id: &str,
        name: impl Into<String>,
        params: Vec<Ejson>,
    ) -> Result<String, StoreError> {
        self.store
            .subscribe(socket_id, name, params, CallOptions::default())
    }

    pub fn unsubscribe(&mut self, socket_id: &str, sub_id: &str) -> Result<(), StoreError> {
        self.store.unsubscribe(socket_id, sub_id)
    }

    pub fn login(&mut self, socket_id: &str, params: Ejson) -> Result<String, StoreError> {
        self.store.login(socket_id, params)
    }

    pub fn logout(&mut self, socket_id: &str) -> Result<String, StoreError> {
        self.store.logout(socket_id)
    }

    /// Forgets the documents a finished method call contributed.
    pub fn release(&mut self, data_source_id: impl Into<String>) {
        self.store.release(data_source_id);
    }

    pub fn state(&self) -> &State {
        self.store.state()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// Receives the next reduced action, driving transports and the flush
    /// timer while none is buffered.
    pub async fn recv(&mut self) -> Option<Action> {
        loop {
            if let Some(action) = self.store.take_dispatched() {
                return Some(action);
            }

            tokio::select! {
                event = self.transport_rx.recv() => match event {
                    Some((socket_id, event)) => {
                        self.store.handle_transport_event(&socket_id, event);
                    }
                    None => return None,
                },
                token = self.flush_rx.recv() => match token {
                    Some(token) => self.store.fire_flush_timer(token),
                    None => return None,
                },
            }
        }
    }

    /// Receives actions until one satisfies `predicate`; the others are
    /// dropped.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> Option<Action>
    where
        F: FnMut(&Action) -> bool,
    {
        while let Some(action) = self.recv().await {
            if predicate(&action) {
                return Some(action);
            }
        }
        None
    }
}

impl std::fmt::Debug for DdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdpClient")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
