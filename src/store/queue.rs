//! Method call queue: pending-call table and priority-sorted backlog.
//!
//! State is kept per queue id. Actions name their queue through
//! `meta.queue.id`; socket-level events (connect, disconnect) fall back to the
//! socket id, which is also the queue id every socket-scoped call uses.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::store::{Action, ActionKind};

/// Synthetic pending entry standing for the handshake of a (re)connection.
pub const CONNECT_CALL_ID: &str = "[connect]";
/// Priority of [`CONNECT_CALL_ID`]; everything below waits for `connected`.
pub const CONNECT_PRIORITY: i64 = 100;

static NO_PENDING: BTreeMap<String, i64> = BTreeMap::new();

/// Deferred action waiting for the watermark to drop.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub priority: i64,
    /// Original action with its kind and meta restored.
    pub action: Action,
}

#[derive(Clone, Debug, Default)]
pub struct QueueState {
    pub pending: BTreeMap<String, i64>,
    pub backlog: Vec<QueueEntry>,
}

impl QueueState {
    pub fn watermark(&self) -> Option<i64> {
        self.pending.values().copied().max()
    }

    /// Inserts before the first entry whose priority is not above the new one.
    fn insert(&mut self, entry: QueueEntry) {
        let at = self
            .backlog
            .iter()
            .position(|existing| existing.priority <= entry.priority)
            .unwrap_or(self.backlog.len());
        self.backlog.insert(at, entry);
    }

    fn drop_call(&mut self, call_id: &str) -> bool {
        let before = self.backlog.len();
        self.backlog
            .retain(|entry| entry.action.kind.call_id() != Some(call_id));
        before != self.backlog.len()
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueueTable {
    queues: HashMap<String, QueueState>,
}

impl QueueTable {
    pub fn get(&self, queue_id: &str) -> Option<&QueueState> {
        self.queues.get(queue_id)
    }

    /// Highest pending priority, `None` when nothing is pending.
    pub fn watermark(&self, queue_id: &str) -> Option<i64> {
        self.get(queue_id).and_then(QueueState::watermark)
    }

    pub fn pending(&self, queue_id: &str) -> &BTreeMap<String, i64> {
        self.get(queue_id).map_or(&NO_PENDING, |queue| &queue.pending)
    }

    pub fn backlog(&self, queue_id: &str) -> &[QueueEntry] {
        match self.get(queue_id) {
            Some(queue) => &queue.backlog,
            None => &[],
        }
    }

    pub fn handle(this: &Arc<Self>, action: &Action) -> Arc<Self> {
        let queue_id = match (&action.meta.queue, &action.meta.socket_id) {
            (Some(queue), _) => queue.id.as_str(),
            (None, Some(socket_id)) => socket_id.as_str(),
            (None, None) => return Arc::clone(this),
        };

        match &action.kind {
            ActionKind::Connect { .. } | ActionKind::Close | ActionKind::Disconnected => {
                update(this, queue_id, |queue| {
                    queue.pending = BTreeMap::from([(CONNECT_CALL_ID.to_string(), CONNECT_PRIORITY)]);
                    true
                })
            }
            ActionKind::Connected { .. } => update(this, queue_id, |queue| {
                let changed = !queue.pending.is_empty();
                queue.pending.clear();
                changed
            }),
            ActionKind::Enqueue(inner) => {
                let priority = action
                    .meta
                    .queue
                    .as_ref()
                    .map_or(0, |queue| queue.priority());
                let original = Action {
                    kind: (**inner).clone(),
                    meta: action.meta.clone(),
                };
                update(this, queue_id, |queue| {
                    queue.insert(QueueEntry {
                        priority,
                        action: original,
                    });
                    true
                })
            }
            ActionKind::Method { id, .. } | ActionKind::Subscribe { id, .. } => {
                let Some(meta) = &action.meta.queue else {
                    return Arc::clone(this);
                };
                let priority = meta.priority();
                update(this, queue_id, |queue| {
                    queue.drop_call(id);
                    queue.pending.insert(id.clone(), priority);
                    true
                })
            }
            ActionKind::Unsubscribe { id } => update(this, queue_id, |queue| {
                let dropped = queue.drop_call(id);
                queue.pending.remove(id).is_some() || dropped
            }),
            ActionKind::Result { id, .. } | ActionKind::Nosub { id, .. } => {
                update(this, queue_id, |queue| queue.pending.remove(id).is_some())
            }
            ActionKind::Ready { subs } => update(this, queue_id, |queue| {
                subs.iter()
                    .fold(false, |changed, sub| queue.pending.remove(sub).is_some() || changed)
            }),
            _ => Arc::clone(this),
        }
    }
}

/// Applies `f` to a copy of the table; keeps `this` when `f` reports no change.
fn update(
    this: &Arc<QueueTable>,
    queue_id: &str,
    f: impl FnOnce(&mut QueueState) -> bool,
) -> Arc<QueueTable> {
    let mut next = QueueTable::clone(this);
    if f(next.queues.entry(queue_id.to_string()).or_default()) {
        Arc::new(next)
    } else {
        Arc::clone(this)
    }
}
