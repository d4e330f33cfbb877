//! Terminal interceptor bridging admitted actions to socket sessions.

use crate::proto::Envelope;
use crate::store::{Action, ActionKind, Chain, Interceptor};

pub struct Outbound;

impl Interceptor for Outbound {
    fn intercept(&self, action: Action, chain: &mut Chain<'_>) {
        let Some(socket_id) = action.meta.socket_id.clone() else {
            return chain.next(action);
        };

        let envelope = match &action.kind {
            ActionKind::Connect { endpoint } => {
                let endpoint = endpoint.clone();
                chain.next(action);
                return chain.open_session(&socket_id, &endpoint);
            }
            ActionKind::Close => {
                chain.next(action);
                return chain.close_session(&socket_id);
            }
            ActionKind::Open => {
                chain.next(action);
                let session = chain.last_session(&socket_id);
                return chain.send(&socket_id, &Envelope::connect(session));
            }
            ActionKind::Ping { id } => {
                let pong = Envelope::Pong { id: id.clone() };
                chain.next(action);
                return chain.send(&socket_id, &pong);
            }
            ActionKind::Method { id, name, params } => Envelope::Method {
                id: id.clone(),
                method: name.clone(),
                params: params.clone(),
            },
            ActionKind::Subscribe { id, name, params } => Envelope::Sub {
                id: id.clone(),
                name: name.clone(),
                params: params.clone(),
            },
            ActionKind::Unsubscribe { id } => Envelope::Unsub { id: id.clone() },
            _ => return chain.next(action),
        };

        chain.send(&socket_id, &envelope);
        chain.next(action);
    }
}

#[cfg(test)]
mod tests {
    use crate::socket::transport::TransportEvent;
    use crate::store::tests::Harness;
    use crate::store::CallOptions;

    #[test]
    fn reconnect_handshake_carries_previous_session() {
        let mut harness = Harness::connected();
        harness.store.handle_transport_event("s1", TransportEvent::Close);
        harness.open("s1");

        assert_eq!(
            harness.sent().last().map(String::as_str),
            Some(r#"{"msg":"connect","session":"sess-1","support":["1","pre2","pre1"],"version":"1"}"#)
        );
    }

    #[test]
    fn close_request_closes_the_transport() {
        let mut harness = Harness::connected();
        harness.store.close_socket("s1").expect("close");
        assert_eq!(*harness.transport.closes.lock().unwrap(), 1);
        assert_eq!(harness.drain_names().last(), Some(&"close"));
    }

    #[test]
    fn connect_opens_the_transport_at_the_endpoint() {
        let harness = Harness::connected();
        assert_eq!(
            *harness.transport.opened.lock().unwrap(),
            vec!["ws://localhost:3000/websocket".to_string()]
        );
    }

    #[test]
    fn method_params_keep_extended_types() {
        let mut harness = Harness::connected();
        let when = chrono::DateTime::from_timestamp_millis(1_700_000_000_000).expect("timestamp");
        let id = harness
            .store
            .call(
                "s1",
                "events.at",
                vec![when.into(), crate::ejson::Ejson::Binary(vec![1, 2, 3])],
                CallOptions::default(),
            )
            .expect("call");

        assert_eq!(
            harness.sent().last().cloned(),
            Some(format!(
                r#"{{"id":"{id}","method":"events.at","msg":"method","params":[{{"$date":1700000000000}},{{"$binary":"AQID"}}]}}"#
            ))
        );
    }
}
