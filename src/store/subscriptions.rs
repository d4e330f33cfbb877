//! Registry of sent subscriptions, replayed after a reconnect.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::ejson::Ejson;
use crate::store::{Action, ActionKind, Chain, Interceptor, DEFAULT_PRIORITY};

#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionRecord {
    pub socket_id: String,
    pub name: String,
    pub params: Vec<Ejson>,
    pub priority: i64,
    pub ready: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SubscriptionTable {
    subs: BTreeMap<String, SubscriptionRecord>,
}

impl SubscriptionTable {
    pub fn get(&self, sub_id: &str) -> Option<&SubscriptionRecord> {
        self.subs.get(sub_id)
    }

    pub fn is_ready(&self, sub_id: &str) -> bool {
        self.get(sub_id).is_some_and(|record| record.ready)
    }

    pub fn for_socket<'a>(
        &'a self,
        socket_id: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a SubscriptionRecord)> + 'a {
        self.subs
            .iter()
            .filter(move |(_, record)| record.socket_id == socket_id)
    }

    pub fn handle(this: &Arc<Self>, action: &Action) -> Arc<Self> {
        let Some(socket_id) = action.socket_id() else {
            return Arc::clone(this);
        };

        match &action.kind {
            ActionKind::Subscribe { id, name, params } => {
                let mut next = Self::clone(this);
                next.subs.insert(
                    id.clone(),
                    SubscriptionRecord {
                        socket_id: socket_id.to_string(),
                        name: name.clone(),
                        params: params.clone(),
                        priority: action
                            .meta
                            .queue
                            .as_ref()
                            .map_or(DEFAULT_PRIORITY, |queue| queue.priority()),
                        ready: false,
                    },
                );
                Arc::new(next)
            }
            ActionKind::Ready { subs } => {
                let pending: Vec<&String> = subs
                    .iter()
                    .filter(|id| this.get(id).is_some_and(|record| !record.ready))
                    .collect();
                if pending.is_empty() {
                    return Arc::clone(this);
                }
                let mut next = Self::clone(this);
                for id in pending {
                    if let Some(record) = next.subs.get_mut(id) {
                        record.ready = true;
                    }
                }
                Arc::new(next)
            }
            ActionKind::Nosub { id, .. } | ActionKind::Unsubscribe { id } => {
                if !this.subs.contains_key(id) {
                    return Arc::clone(this);
                }
                let mut next = Self::clone(this);
                next.subs.remove(id);
                Arc::new(next)
            }
            ActionKind::Disconnected => {
                if !this.for_socket(socket_id).any(|(_, record)| record.ready) {
                    return Arc::clone(this);
                }
                let mut next = Self::clone(this);
                for record in next.subs.values_mut() {
                    if record.socket_id == socket_id {
                        record.ready = false;
                    }
                }
                Arc::new(next)
            }
            _ => Arc::clone(this),
        }
    }
}

/// Re-sends every recorded subscription of a socket once it is connected
/// again, under the original ids.
pub struct Resubscribe;

impl Interceptor for Resubscribe {
    fn intercept(&self, action: Action, chain: &mut Chain<'_>) {
        let socket_id = match (&action.kind, action.socket_id()) {
            (ActionKind::Connected { .. }, Some(socket_id)) => socket_id.to_string(),
            _ => return chain.next(action),
        };
        chain.next(action);

        let replay: Vec<Action> = chain
            .state()
            .subscriptions
            .for_socket(&socket_id)
            .map(|(id, record)| {
                Action::new(ActionKind::Subscribe {
                    id: id.clone(),
                    name: record.name.clone(),
                    params: record.params.clone(),
                })
                .for_socket(socket_id.as_str())
                .queued(socket_id.as_str(), record.priority)
            })
            .collect();
        if !replay.is_empty() {
            debug!(event = "resubscribe", socket_id = %socket_id, count = replay.len());
        }
        for action in replay {
            chain.dispatch(action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::transport::TransportEvent;
    use crate::store::tests::Harness;
    use crate::store::CallOptions;

    #[test]
    fn ready_and_nosub_update_the_registry() {
        let mut harness = Harness::connected();
        let todos = harness
            .store
            .subscribe("s1", "todos", vec![Ejson::from("open")], CallOptions::default())
            .expect("subscribe");
        let secret = harness
            .store
            .subscribe("s1", "secret", Vec::new(), CallOptions::default())
            .expect("subscribe");
        assert!(!harness.store.state().subscriptions.is_ready(&todos));

        harness.inbound("s1", &format!(r#"{{"msg":"ready","subs":["{todos}"]}}"#));
        harness.inbound(
            "s1",
            &format!(r#"{{"msg":"nosub","id":"{secret}","error":{{"error":"not-authorized"}}}}"#),
        );

        let subs = &harness.store.state().subscriptions;
        assert!(subs.is_ready(&todos));
        assert!(subs.get(&secret).is_none());
    }

    #[test]
    fn reconnect_replays_subscriptions_with_original_ids() {
        let mut harness = Harness::connected();
        let todos = harness
            .store
            .subscribe("s1", "todos", vec![Ejson::from("open")], CallOptions::default())
            .expect("subscribe");
        harness.inbound("s1", &format!(r#"{{"msg":"ready","subs":["{todos}"]}}"#));

        harness.store.handle_transport_event("s1", TransportEvent::Close);
        assert!(!harness.store.state().subscriptions.is_ready(&todos));
        harness.open("s1");
        harness.inbound("s1", r#"{"msg":"connected","session":"sess-2"}"#);

        let expected =
            format!(r#"{{"id":"{todos}","msg":"sub","name":"todos","params":["open"]}}"#);
        let sent = harness.sent();
        assert_eq!(sent.iter().filter(|frame| **frame == expected).count(), 2);
        assert_eq!(sent.last(), Some(&expected));
    }

    #[test]
    fn unsubscribe_sends_unsub_and_forgets() {
        let mut harness = Harness::connected();
        let todos = harness
            .store
            .subscribe("s1", "todos", Vec::new(), CallOptions::default())
            .expect("subscribe");

        harness.store.unsubscribe("s1", &todos).expect("unsubscribe");

        assert_eq!(
            harness.sent().last(),
            Some(&format!(r#"{{"id":"{todos}","msg":"unsub"}}"#))
        );
        assert!(harness.store.state().subscriptions.get(&todos).is_none());
        assert!(harness.store.state().queues.pending("s1").is_empty());
    }
}
