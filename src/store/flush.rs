//! Flush scheduling.
//!
//! Mutations coalesce behind a single debounce timer; each structurally
//! mutating action re-arms it. Sync-completion actions (`ready`, `updated`)
//! flush right away so observers see the documents they waited for before the
//! completion itself.

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::{Action, ActionKind, Chain, Interceptor};

/// Default debounce window before dirty collections are flushed.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Cancellable one-shot timer reporting expiry by token.
pub trait FlushTimer: Send {
    /// Schedules `token` to fire after `after`, replacing any armed timer.
    fn arm(&mut self, after: Duration, token: u64);
    fn cancel(&mut self);
}

/// Timer backed by a spawned tokio task that sends its token on expiry.
pub struct TokioFlushTimer {
    tx: mpsc::UnboundedSender<u64>,
    task: Option<JoinHandle<()>>,
}

impl TokioFlushTimer {
    pub fn new(tx: mpsc::UnboundedSender<u64>) -> Self {
        Self { tx, task: None }
    }
}

impl FlushTimer for TokioFlushTimer {
    fn arm(&mut self, after: Duration, token: u64) {
        self.cancel();
        let Ok(handle) = Handle::try_current() else {
            warn!(event = "flush_timer_without_runtime", token);
            return;
        };
        let tx = self.tx.clone();
        let deadline = Instant::now() + after;
        self.task = Some(handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(token);
        }));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TokioFlushTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The store's only timer slot. Tokens from earlier arms are ignored.
pub struct FlushSlot {
    timer: Box<dyn FlushTimer>,
    interval: Duration,
    armed: Option<u64>,
    next_token: u64,
}

impl FlushSlot {
    pub fn new(timer: Box<dyn FlushTimer>, interval: Duration) -> Self {
        Self {
            timer,
            interval,
            armed: None,
            next_token: 0,
        }
    }

    pub fn arm(&mut self) {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.armed = Some(token);
        self.timer.arm(self.interval, token);
    }

    pub fn cancel(&mut self) {
        if self.armed.take().is_some() {
            self.timer.cancel();
        }
    }

    /// Consumes an expiry; `false` for stale or cancelled tokens.
    pub fn expire(&mut self, token: u64) -> bool {
        if self.armed == Some(token) {
            self.armed = None;
            true
        } else {
            debug!(event = "flush_token_stale", token);
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for FlushSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for FlushSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushSlot")
            .field("interval", &self.interval)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

fn schedules_flush(kind: &ActionKind) -> bool {
    matches!(
        kind,
        ActionKind::Added { .. }
            | ActionKind::Changed { .. }
            | ActionKind::Removed { .. }
            | ActionKind::Method { .. }
            | ActionKind::Subscribe { .. }
            | ActionKind::Enqueue(_)
            | ActionKind::Result { .. }
            | ActionKind::ReleaseDataSource { .. }
    )
}

fn forces_flush(kind: &ActionKind) -> bool {
    matches!(kind, ActionKind::Ready { .. } | ActionKind::Updated { .. })
}

pub struct FlushScheduler;

impl Interceptor for FlushScheduler {
    fn intercept(&self, action: Action, chain: &mut Chain<'_>) {
        if forces_flush(&action.kind) {
            chain.cancel_flush();
            chain.dispatch(Action::new(ActionKind::Flush));
        } else if schedules_flush(&action.kind) {
            chain.arm_flush();
        }
        chain.next(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::socket::session::tests::RecordingTransport;
    use crate::socket::transport::TransportEvent;
    use crate::store::tests::{Harness, ManualTimer};
    use crate::store::Store;

    fn message(text: &str) -> TransportEvent {
        TransportEvent::Message(text.to_string())
    }

    #[test]
    fn slot_ignores_stale_tokens() {
        let timer = ManualTimer::default();
        let mut slot = FlushSlot::new(Box::new(timer.clone()), DEFAULT_FLUSH_INTERVAL);

        slot.arm();
        let first = timer.armed().expect("armed");
        slot.arm();
        let second = timer.armed().expect("re-armed");

        assert_ne!(first, second);
        assert!(!slot.expire(first));
        assert!(slot.expire(second));
        assert!(!slot.expire(second));
    }

    #[test]
    fn dropping_the_slot_cancels_the_timer() {
        let timer = ManualTimer::default();
        let mut slot = FlushSlot::new(Box::new(timer.clone()), DEFAULT_FLUSH_INTERVAL);
        slot.arm();
        drop(slot);
        assert_eq!(timer.armed(), None);
    }

    #[test]
    fn document_updates_coalesce_into_one_flush() {
        let mut harness = Harness::connected();
        harness.drain_names();

        harness.inbound(
            "s1",
            r#"{"msg":"added","collection":"todos","id":"a","fields":{"title":"milk"}}"#,
        );
        harness.inbound(
            "s1",
            r#"{"msg":"changed","collection":"todos","id":"a","fields":{"done":true}}"#,
        );
        assert_eq!(*harness.timer.arm_count.lock().unwrap(), 2);
        assert_eq!(harness.drain_names(), vec!["added", "changed"]);

        let token = harness.timer.armed().expect("armed");
        harness.store.fire_flush_timer(token);

        assert_eq!(harness.drain_names(), vec!["flush"]);
        assert!(!harness.store.state().collections.needs_update());
    }

    #[test]
    fn expiry_without_dirty_collections_dispatches_nothing() {
        let mut harness = Harness::connected();
        harness
            .store
            .call("s1", "ping", Vec::new(), Default::default())
            .expect("call");
        harness.drain_names();

        let token = harness.timer.armed().expect("method arms the timer");
        harness.store.fire_flush_timer(token);

        assert!(harness.drain_names().is_empty());
    }

    #[test]
    fn ready_flushes_before_it_is_reduced() {
        let mut harness = Harness::connected();
        let sub = harness
            .store
            .subscribe("s1", "todos", Vec::new(), Default::default())
            .expect("subscribe");
        harness.inbound(
            "s1",
            r#"{"msg":"added","collection":"todos","id":"a","fields":{"title":"milk"}}"#,
        );
        harness.drain_names();

        harness.inbound("s1", &format!(r#"{{"msg":"ready","subs":["{sub}"]}}"#));

        assert_eq!(harness.drain_names(), vec!["flush", "ready"]);
        assert_eq!(harness.timer.armed(), None);
        let todos = harness.store.state().collections.documents("todos");
        assert!(todos.is_some_and(|docs| docs.contains_key("a")));
    }

    #[test]
    fn sent_subscription_rearms_the_timer() {
        let mut harness = Harness::connected();
        let before = *harness.timer.arm_count.lock().unwrap();

        harness
            .store
            .subscribe("s1", "todos", Vec::new(), Default::default())
            .expect("subscribe");

        assert_eq!(*harness.timer.arm_count.lock().unwrap(), before + 1);
        assert!(harness.timer.armed().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_timer_fires_one_interval_after_the_last_mutation() {
        let interval = Duration::from_millis(100);
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel();
        let (transport_tx, _transport_rx) = mpsc::unbounded_channel();
        let mut store = Store::new(
            ClientConfig::default().with_flush_interval(interval),
            Box::new(TokioFlushTimer::new(flush_tx)),
            transport_tx,
        );
        store
            .open_socket(
                "s1",
                "ws://localhost:3000/websocket",
                Box::new(RecordingTransport::default()),
            )
            .expect("open socket");
        store.handle_transport_event("s1", TransportEvent::Open);
        store.handle_transport_event("s1", message(r#"{"msg":"connected","session":"sess-1"}"#));

        store.handle_transport_event(
            "s1",
            message(r#"{"msg":"added","collection":"todos","id":"a","fields":{"title":"milk"}}"#),
        );
        tokio::time::advance(Duration::from_millis(60)).await;
        store.handle_transport_event(
            "s1",
            message(r#"{"msg":"changed","collection":"todos","id":"a","fields":{"done":true}}"#),
        );
        let last_mutation = Instant::now();

        // Past the first mutation's deadline, short of the last one's.
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(flush_rx.try_recv().is_err());

        let token = flush_rx.recv().await.expect("flush token");
        let elapsed = Instant::now() - last_mutation;
        assert!(elapsed >= interval, "fired after {elapsed:?}");
        assert!(elapsed < interval + Duration::from_millis(5), "fired after {elapsed:?}");

        while store.take_dispatched().is_some() {}
        store.fire_flush_timer(token);
        let flushed = store.take_dispatched().map(|action| action.kind);
        assert!(matches!(flushed, Some(ActionKind::Flush)));
        assert!(store
            .state()
            .collections
            .documents("todos")
            .is_some_and(|docs| docs.contains_key("a")));
    }
}
