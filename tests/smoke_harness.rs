use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ddp_client::store::auth::LoginState;
use ddp_client::{Action, ActionKind, ClientConfig, DdpClient, Ejson};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

const SOCKET_ID: &str = "main";
const SERVER_SESSION: &str = "srv-session-1";
const TEST_USER_ID: &str = "user-1";
const TEST_RESUME_TOKEN: &str = "resume-token-1";
const TEST_DUE_MS: i64 = 1_700_000_000_000;
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct DdpState {
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Vec<String>>>>>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ddp_client_smoke_subscribe_call_login_close() {
    let (observed_tx, observed_rx) = oneshot::channel();
    let app = Router::new()
        .route("/websocket", get(ddp_handler))
        .with_state(DdpState {
            observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
        });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let mut client =
        DdpClient::new(ClientConfig::default().with_flush_interval(Duration::from_millis(20)));
    client
        .connect(SOCKET_ID, &format!("ws://{addr}/websocket"))
        .expect("open socket against mock ddp server");
    let sub_id = client
        .subscribe(SOCKET_ID, "todos", Vec::new())
        .expect("subscribe before handshake");

    let ready = recv_matching(&mut client, |action| {
        matches!(action.kind, ActionKind::Ready { .. })
    })
    .await;
    let ActionKind::Ready { subs } = ready.kind else {
        unreachable!("filtered on ready");
    };
    assert_eq!(subs, vec![sub_id.clone()]);
    assert!(client.state().subscriptions.is_ready(&sub_id));

    let todos = client
        .state()
        .collections
        .documents("todos")
        .expect("todos flushed before ready");
    let todo = todos.get("t1").expect("document t1");
    assert_eq!(todo.get("_id"), Some(&Ejson::from("t1")));
    assert_eq!(todo.get("title"), Some(&Ejson::from("milk")));
    assert!(matches!(
        todo.get("due"),
        Some(Ejson::Date(due)) if due.timestamp_millis() == TEST_DUE_MS
    ));

    let call_id = client
        .call(SOCKET_ID, "todos.echo", vec![Ejson::from("hello")])
        .expect("call");
    let result = recv_matching(&mut client, |action| {
        matches!(&action.kind, ActionKind::Result { id, .. } if *id == call_id)
    })
    .await;
    let ActionKind::Result { result, error, .. } = result.kind else {
        unreachable!("filtered on result");
    };
    assert!(error.is_none(), "unexpected method error: {error:?}");
    assert_eq!(
        result.and_then(|value| value.get("echo").cloned()),
        Some(Ejson::Array(vec![Ejson::from("hello")]))
    );
    assert!(client.state().queues.pending(SOCKET_ID).is_empty());

    client
        .login(
            SOCKET_ID,
            Ejson::object()
                .with("user", Ejson::object().with("username", "ada"))
                .with("password", "secret"),
        )
        .expect("login");
    recv_matching(&mut client, |action| {
        matches!(action.kind, ActionKind::LoggedIn { .. })
    })
    .await;
    assert_eq!(client.state().auth.state(SOCKET_ID), LoginState::LoggedIn);
    assert_eq!(client.state().auth.user_id(SOCKET_ID), Some(TEST_USER_ID));

    client.close(SOCKET_ID).expect("close socket");
    recv_matching(&mut client, |action| {
        matches!(action.kind, ActionKind::Disconnected)
    })
    .await;
    assert!(client.state().auth.get(SOCKET_ID).is_none());

    let observed = timeout(RECV_TIMEOUT, observed_rx)
        .await
        .expect("timed out waiting for ddp server observations")
        .expect("ddp observation channel closed");
    assert_eq!(
        observed,
        vec!["connect", "sub", "pong", "method:todos.echo", "method:login"]
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ddp server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ddp_client_smoke_unreachable_endpoint_reports_error_and_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("listener address");
    drop(listener);

    let mut client = DdpClient::new(ClientConfig::default().with_connect_retry(
        ddp_client::retry::RetryPolicy::once(Duration::from_millis(500)),
    ));
    client
        .connect(SOCKET_ID, &format!("ws://{addr}/websocket"))
        .expect("open socket");
    let call_id = client
        .call(SOCKET_ID, "never.sent", Vec::new())
        .expect("call queued while connecting");

    recv_matching(&mut client, |action| {
        matches!(action.kind, ActionKind::Error { .. })
    })
    .await;
    recv_matching(&mut client, |action| {
        matches!(action.kind, ActionKind::Disconnected)
    })
    .await;

    let queues = &client.state().queues;
    assert!(queues
        .backlog(SOCKET_ID)
        .iter()
        .any(|entry| entry.action.kind.call_id() == Some(call_id.as_str())));
}

async fn recv_matching<F>(client: &mut DdpClient, predicate: F) -> Action
where
    F: FnMut(&Action) -> bool,
{
    timeout(RECV_TIMEOUT, client.recv_until(predicate))
        .await
        .expect("timed out waiting for action")
        .expect("client channels closed")
}

async fn ddp_handler(State(state): State<DdpState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let observed_tx = state.observed_tx.clone();
    ws.on_upgrade(move |socket| async move {
        let observed = run_ddp_server(socket).await;
        if let Some(tx) = observed_tx.lock().await.take() {
            let _ = tx.send(observed);
        }
    })
}

/// Minimal DDP peer: handshake, one publication, echo methods, login.
async fn run_ddp_server(mut socket: WebSocket) -> Vec<String> {
    let mut observed = Vec::new();
    while let Some(Ok(frame)) = socket.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(msg) = serde_json::from_str::<Value>(&text) else {
            observed.push("invalid".to_string());
            continue;
        };

        let replies = match msg["msg"].as_str().unwrap_or_default() {
            "connect" => {
                observed.push("connect".to_string());
                vec![
                    json!({"msg": "connected", "session": SERVER_SESSION}),
                    json!({"msg": "ping", "id": "srv-ping"}),
                ]
            }
            "pong" => {
                observed.push("pong".to_string());
                Vec::new()
            }
            "sub" => {
                observed.push("sub".to_string());
                vec![
                    json!({
                        "msg": "added",
                        "collection": "todos",
                        "id": "t1",
                        "fields": {"title": "milk", "due": {"$date": TEST_DUE_MS}},
                    }),
                    json!({"msg": "ready", "subs": [msg["id"].clone()]}),
                ]
            }
            "method" => {
                let method = msg["method"].as_str().unwrap_or_default();
                observed.push(format!("method:{method}"));
                let result = if method == "login" {
                    json!({"id": TEST_USER_ID, "token": TEST_RESUME_TOKEN})
                } else {
                    json!({"echo": msg["params"].clone()})
                };
                vec![
                    json!({"msg": "result", "id": msg["id"].clone(), "result": result}),
                    json!({"msg": "updated", "methods": [msg["id"].clone()]}),
                ]
            }
            other => {
                observed.push(format!("unexpected:{other}"));
                Vec::new()
            }
        };

        for reply in replies {
            if socket
                .send(Message::Text(reply.to_string()))
                .await
                .is_err()
            {
                return observed;
            }
        }
    }
    observed
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
