//! Per-socket login state and the login/logout method flow.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::ejson::Ejson;
use crate::store::{Action, ActionKind, Chain, Interceptor};

pub const LOGIN_METHOD: &str = "login";
pub const LOGOUT_METHOD: &str = "logout";
/// Login calls jump ahead of ordinary traffic queued behind them.
pub const LOGIN_PRIORITY: i64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginState {
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthCallKind {
    Login,
    Logout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthCall {
    pub id: String,
    pub kind: AuthCallKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthRecord {
    pub state: LoginState,
    pub user_id: Option<String>,
    /// Login or logout call awaiting its result.
    pub pending: Option<AuthCall>,
}

#[derive(Clone, Debug, Default)]
pub struct AuthTable {
    records: HashMap<String, AuthRecord>,
}

impl AuthTable {
    pub fn get(&self, socket_id: &str) -> Option<&AuthRecord> {
        self.records.get(socket_id)
    }

    pub fn state(&self, socket_id: &str) -> LoginState {
        self.get(socket_id)
            .map_or(LoginState::LoggedOut, |record| record.state)
    }

    pub fn user_id(&self, socket_id: &str) -> Option<&str> {
        self.get(socket_id).and_then(|record| record.user_id.as_deref())
    }

    pub fn handle(this: &Arc<Self>, action: &Action) -> Arc<Self> {
        let Some(socket_id) = action.socket_id() else {
            return Arc::clone(this);
        };

        let call = match &action.kind {
            ActionKind::LoginRequest { call_id, .. } => AuthCall {
                id: call_id.clone(),
                kind: AuthCallKind::Login,
            },
            ActionKind::LogoutRequest { call_id } => AuthCall {
                id: call_id.clone(),
                kind: AuthCallKind::Logout,
            },
            ActionKind::LoggedIn { user_id, .. } => {
                let mut next = Self::clone(this);
                next.records.insert(
                    socket_id.to_string(),
                    AuthRecord {
                        state: LoginState::LoggedIn,
                        user_id: Some(user_id.clone()),
                        pending: None,
                    },
                );
                return Arc::new(next);
            }
            ActionKind::LoggedOut | ActionKind::Disconnected => {
                if !this.records.contains_key(socket_id) {
                    return Arc::clone(this);
                }
                let mut next = Self::clone(this);
                next.records.remove(socket_id);
                return Arc::new(next);
            }
            _ => return Arc::clone(this),
        };

        let mut next = Self::clone(this);
        let record = next
            .records
            .entry(socket_id.to_string())
            .or_insert_with(|| AuthRecord {
                state: LoginState::LoggedOut,
                user_id: None,
                pending: None,
            });
        record.state = LoginState::LoggingIn;
        record.pending = Some(call);
        Arc::new(next)
    }
}

/// Turns login/logout requests into method calls and their results into
/// `LoggedIn`/`LoggedOut`. Also replays the resume token after a reconnect.
pub struct AuthFlow;

impl Interceptor for AuthFlow {
    fn intercept(&self, action: Action, chain: &mut Chain<'_>) {
        let Some(socket_id) = action.meta.socket_id.clone() else {
            return chain.next(action);
        };

        match &action.kind {
            ActionKind::LoginRequest { call_id, params } => {
                let method = login_call(&socket_id, call_id, LOGIN_METHOD, vec![params.clone()]);
                chain.next(action);
                chain.dispatch(method);
            }
            ActionKind::LogoutRequest { call_id } => {
                let method = login_call(&socket_id, call_id, LOGOUT_METHOD, Vec::new());
                chain.forget_resume_token(&socket_id);
                chain.next(action);
                chain.dispatch(method);
            }
            ActionKind::Result { id, result, error, .. } => {
                let pending = chain
                    .state()
                    .auth
                    .get(&socket_id)
                    .and_then(|record| record.pending.clone())
                    .filter(|call| &call.id == id);
                let rejected = pending.as_ref().is_some_and(|call| {
                    call.kind == AuthCallKind::Login && error.is_some()
                });
                let outcome = pending.map(|call| match (call.kind, error, result) {
                    (AuthCallKind::Login, None, Some(result)) => logged_in(result),
                    (AuthCallKind::Login, Some(error), _) => {
                        debug!(event = "login_failed", socket_id = %socket_id, reason = ?error.reason);
                        ActionKind::LoggedOut
                    }
                    _ => ActionKind::LoggedOut,
                });
                if rejected {
                    chain.forget_resume_token(&socket_id);
                }
                chain.next(action);
                if let Some(kind) = outcome {
                    chain.dispatch(Action::new(kind).for_socket(socket_id));
                }
            }
            ActionKind::LoggedIn {
                token: Some(token), ..
            } => {
                chain.set_resume_token(&socket_id, token.clone());
                chain.next(action);
            }
            ActionKind::Connected { .. } => {
                chain.next(action);
                if let Some(token) = chain.resume_token(&socket_id) {
                    debug!(event = "login_resume", socket_id = %socket_id);
                    let call_id = chain.generate_id();
                    let params = Ejson::object().with("resume", token.expose_secret().as_str());
                    chain.dispatch(
                        Action::new(ActionKind::LoginRequest { call_id, params }).for_socket(socket_id),
                    );
                }
            }
            _ => chain.next(action),
        }
    }
}

fn login_call(socket_id: &str, call_id: &str, method: &str, params: Vec<Ejson>) -> Action {
    Action::new(ActionKind::Method {
        id: call_id.to_string(),
        name: method.to_string(),
        params,
    })
    .for_socket(socket_id)
    .queued(socket_id, LOGIN_PRIORITY)
}

/// Reads `{id, token}` from a login result.
fn logged_in(result: &Ejson) -> ActionKind {
    match result.get("id").and_then(Ejson::as_str) {
        Some(user_id) => ActionKind::LoggedIn {
            user_id: user_id.to_string(),
            token: result
                .get("token")
                .and_then(Ejson::as_str)
                .map(|token| SecretString::new(token.to_string())),
        },
        None => {
            warn!(event = "login_result_without_user_id");
            ActionKind::LoggedOut
        }
    }
}
