//! DDP protocol messages.
//!
//! Every frame is an object with a `msg` discriminator. [`Envelope`] is
//! generic over its payload values: the serde-derived wire form carries plain
//! [`serde_json::Value`]s ([`WireEnvelope`]), and [`Codec`] revives those into
//! [`Ejson`] so params, results and document fields keep their extended types
//! (dates, binary, registered custom types).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ejson::{Codec, CodecError, Ejson, EjsonMap};

/// Protocol version requested on connect.
pub const DDP_VERSION: &str = "1";
/// Versions offered during the handshake, preferred first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

/// Field set of a document.
pub type Fields = EjsonMap;

/// Envelope exactly as it appears on the wire.
pub type WireEnvelope = Envelope<Value>;

/// Error payload carried by `result`, `nosub` and method failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DdpError {
    /// Error code, a string or number.
    pub error: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum Envelope<V = Ejson> {
    Connect {
        version: String,
        #[serde(default)]
        support: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Connected {
        session: String,
    },
    Failed {
        version: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Method {
        id: String,
        method: String,
        #[serde(default)]
        params: Vec<V>,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<V>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<DdpError>,
    },
    Updated {
        #[serde(default)]
        methods: Vec<String>,
    },
    Sub {
        id: String,
        name: String,
        #[serde(default)]
        params: Vec<V>,
    },
    Unsub {
        id: String,
    },
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<DdpError>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default)]
        fields: BTreeMap<String, V>,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default)]
        fields: BTreeMap<String, V>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Ready {
        #[serde(default)]
        subs: Vec<String>,
    },
    Error {
        #[serde(default)]
        reason: String,
        #[serde(
            rename = "offendingMessage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<V>,
    },
}

/// Errors raised while interpreting a decoded frame as a DDP message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid ddp message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ddp payload: {0}")]
    Codec(#[from] CodecError),
}

impl<V> Envelope<V> {
    /// Wire value of the `msg` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Connect { .. } => "connect",
            Envelope::Connected { .. } => "connected",
            Envelope::Failed { .. } => "failed",
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::Method { .. } => "method",
            Envelope::Result { .. } => "result",
            Envelope::Updated { .. } => "updated",
            Envelope::Sub { .. } => "sub",
            Envelope::Unsub { .. } => "unsub",
            Envelope::Nosub { .. } => "nosub",
            Envelope::Added { .. } => "added",
            Envelope::Changed { .. } => "changed",
            Envelope::Removed { .. } => "removed",
            Envelope::Ready { .. } => "ready",
            Envelope::Error { .. } => "error",
        }
    }

    /// Converts every payload value, keeping the message shape.
    pub fn try_map<W, E>(self, mut f: impl FnMut(V) -> Result<W, E>) -> Result<Envelope<W>, E> {
        Ok(match self {
            Envelope::Connect {
                version,
                support,
                session,
            } => Envelope::Connect {
                version,
                support,
                session,
            },
            Envelope::Connected { session } => Envelope::Connected { session },
            Envelope::Failed { version } => Envelope::Failed { version },
            Envelope::Ping { id } => Envelope::Ping { id },
            Envelope::Pong { id } => Envelope::Pong { id },
            Envelope::Method { id, method, params } => Envelope::Method {
                id,
                method,
                params: params.into_iter().map(&mut f).collect::<Result<_, _>>()?,
            },
            Envelope::Result { id, result, error } => Envelope::Result {
                id,
                result: result.map(&mut f).transpose()?,
                error,
            },
            Envelope::Updated { methods } => Envelope::Updated { methods },
            Envelope::Sub { id, name, params } => Envelope::Sub {
                id,
                name,
                params: params.into_iter().map(&mut f).collect::<Result<_, _>>()?,
            },
            Envelope::Unsub { id } => Envelope::Unsub { id },
            Envelope::Nosub { id, error } => Envelope::Nosub { id, error },
            Envelope::Added {
                collection,
                id,
                fields,
            } => Envelope::Added {
                collection,
                id,
                fields: map_fields(fields, &mut f)?,
            },
            Envelope::Changed {
                collection,
                id,
                fields,
                cleared,
            } => Envelope::Changed {
                collection,
                id,
                fields: map_fields(fields, &mut f)?,
                cleared,
            },
            Envelope::Removed { collection, id } => Envelope::Removed { collection, id },
            Envelope::Ready { subs } => Envelope::Ready { subs },
            Envelope::Error {
                reason,
                offending_message,
            } => Envelope::Error {
                reason,
                offending_message: offending_message.map(&mut f).transpose()?,
            },
        })
    }
}

impl Envelope {
    /// Handshake opening a new session, or resuming `session`.
    pub fn connect(session: Option<String>) -> Self {
        Envelope::Connect {
            version: DDP_VERSION.to_string(),
            support: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            session,
        }
    }

    /// Interprets a decoded frame, reviving payload values through `codec`.
    pub fn from_ejson(value: &Ejson, codec: &Codec) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_value(codec.to_json_value(value)?)?;
        Ok(wire.try_map(|payload| codec.from_json_value(&payload))?)
    }

    /// Wire form of the message with payload values encoded through `codec`.
    pub fn to_wire(&self, codec: &Codec) -> Result<WireEnvelope, CodecError> {
        self.clone().try_map(|payload| codec.to_json_value(&payload))
    }
}

impl WireEnvelope {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Text frame with keys in sorted order.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&serde_json::to_value(self)?)
    }
}

/// Frames announcing the server (`{"server_id": "0"}`) carry no `msg` and are
/// not part of the message set.
pub fn is_server_id_frame(value: &Ejson) -> bool {
    value.get("msg").is_none() && value.get("server_id").is_some()
}

fn map_fields<V, W, E>(
    fields: BTreeMap<String, V>,
    f: &mut impl FnMut(V) -> Result<W, E>,
) -> Result<BTreeMap<String, W>, E> {
    fields
        .into_iter()
        .map(|(key, value)| f(value).map(|value| (key, value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ejson::{CustomValue, TypeRegistry};

    fn parse(text: &str) -> Result<Envelope, ProtocolError> {
        let codec = Codec::default();
        let value = codec.decode(text).expect("valid json");
        Envelope::from_ejson(&value, &codec)
    }

    fn encode(envelope: &Envelope) -> String {
        envelope
            .to_wire(&Codec::default())
            .expect("encode payload")
            .to_text()
            .expect("encode text")
    }

    #[test]
    fn connect_handshake_encodes_versions() {
        assert_eq!(
            encode(&Envelope::connect(None)),
            r#"{"msg":"connect","support":["1","pre2","pre1"],"version":"1"}"#
        );
    }

    #[test]
    fn changed_message_parses_fields_and_cleared() {
        let envelope = parse(
            r#"{"msg":"changed","collection":"todos","id":"a","fields":{"done":true},"cleared":["note"]}"#,
        )
        .expect("parse");
        let mut fields = Fields::new();
        fields.insert("done".to_string(), Ejson::Bool(true));
        assert_eq!(
            envelope,
            Envelope::Changed {
                collection: "todos".to_string(),
                id: "a".to_string(),
                fields,
                cleared: vec!["note".to_string()],
            }
        );
    }

    #[test]
    fn added_fields_are_revived_into_extended_types() {
        let envelope = parse(
            r#"{"msg":"added","collection":"todos","id":"a","fields":{"due":{"$date":1000},"tag":{"$escape":{"$date":"literal"}}}}"#,
        )
        .expect("parse");
        let Envelope::Added { fields, .. } = envelope else {
            panic!("expected added");
        };
        assert!(matches!(
            fields.get("due"),
            Some(Ejson::Date(due)) if due.timestamp_millis() == 1000
        ));
        assert_eq!(
            fields.get("tag"),
            Some(&Ejson::object().with("$date", "literal"))
        );
    }

    #[test]
    fn method_params_encode_custom_types_through_the_registry() {
        let mut registry = TypeRegistry::new();
        registry
            .register(
                "point",
                |point: &(i64, i64)| json!([point.0, point.1]),
                |value: &Value| match value.as_array().map(Vec::as_slice) {
                    Some([x, y]) => Ok((x.as_i64().unwrap_or(0), y.as_i64().unwrap_or(0))),
                    _ => Err("expected [x, y]".to_string()),
                },
            )
            .expect("register point");
        let codec = Codec::new(std::sync::Arc::new(registry));
        let envelope = Envelope::Method {
            id: "1".to_string(),
            method: "move".to_string(),
            params: vec![Ejson::Custom(CustomValue::new("point", (1i64, 2i64)))],
        };

        let text = envelope.to_wire(&codec).expect("wire").to_text().expect("text");

        assert_eq!(
            text,
            r#"{"id":"1","method":"move","msg":"method","params":[{"$type":"point","$value":[1,2]}]}"#
        );
    }

    #[test]
    fn result_with_error_keeps_error_payload() {
        let envelope = parse(
            r#"{"msg":"result","id":"7","error":{"error":403,"reason":"Access denied"}}"#,
        )
        .expect("parse");
        let Envelope::Result { id, result, error } = envelope else {
            panic!("expected result");
        };
        assert_eq!(id, "7");
        assert!(result.is_none());
        let error = error.expect("error payload");
        assert_eq!(error.error, json!(403));
        assert_eq!(error.reason.as_deref(), Some("Access denied"));
    }

    #[test]
    fn missing_required_field_is_reported() {
        let err = parse(r#"{"msg":"added","id":"a"}"#).expect_err("missing collection");
        assert!(
            err.to_string().contains("missing field `collection`"),
            "{err}"
        );
    }

    #[test]
    fn unknown_and_untagged_frames_are_rejected() {
        let unknown = WireEnvelope::from_text(r#"{"msg":"teleport"}"#).expect_err("unknown");
        assert!(unknown.to_string().contains("unknown variant `teleport`"));

        let untagged = WireEnvelope::from_text(r#"{"id":"0"}"#).expect_err("untagged");
        assert!(untagged.to_string().contains("missing field `msg`"));

        assert!(parse("[1,2]").is_err());
    }

    #[test]
    fn server_id_frames_are_recognised() {
        let codec = Codec::default();
        let announce = codec.decode(r#"{"server_id":"0"}"#).expect("decode");
        let ping = codec.decode(r#"{"msg":"ping"}"#).expect("decode");

        assert!(is_server_id_frame(&announce));
        assert!(!is_server_id_frame(&ping));
    }

    #[test]
    fn ping_without_id_round_trips_through_text() {
        let envelope = parse(r#"{"msg":"ping"}"#).expect("parse");
        assert_eq!(envelope, Envelope::Ping { id: None });
        assert_eq!(encode(&Envelope::Pong { id: None }), r#"{"msg":"pong"}"#);
    }
}
