//! Priority gate in front of every queue-governed action.
//!
//! An action of priority `P` for queue `Q` is forwarded only while no pending
//! call of `Q` has a higher priority; otherwise it is parked in the backlog as
//! [`ActionKind::Enqueue`]. Resolving actions (results, ready, connected)
//! reopen the gate and drain the backlog front to back.

use tracing::debug;

use crate::store::{Action, ActionKind, Chain, Interceptor};

pub struct AdmissionControl;

/// `None` watermark means nothing is pending.
fn admits(watermark: Option<i64>, priority: i64) -> bool {
    watermark.map_or(true, |watermark| priority >= watermark)
}

impl Interceptor for AdmissionControl {
    fn intercept(&self, action: Action, chain: &mut Chain<'_>) {
        let Some(queue) = action.meta.queue.clone() else {
            return chain.next(action);
        };
        if matches!(action.kind, ActionKind::Enqueue(_)) {
            return chain.next(action);
        }

        if !queue.resolve {
            let watermark = chain.state().queues.watermark(&queue.id);
            if admits(watermark, queue.priority()) {
                return chain.next(action);
            }
            debug!(
                event = "action_deferred",
                queue_id = %queue.id,
                kind = action.kind.name(),
                priority = queue.priority(),
                watermark = ?watermark
            );
            return chain.dispatch(Action {
                kind: ActionKind::Enqueue(Box::new(action.kind)),
                meta: action.meta,
            });
        }

        chain.next(action);

        let backlog = chain.state().queues.backlog(&queue.id).to_vec();
        for entry in backlog {
            if !admits(chain.state().queues.watermark(&queue.id), entry.priority) {
                break;
            }
            chain.dispatch(entry.action);
        }
    }
}
