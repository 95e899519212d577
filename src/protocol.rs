//! Messages exchanged over the tunnel channel.
//!
//! Every frame is a single JSON object in a WebSocket text message, tagged by
//! its `type` field. A frame that fails to decode is a protocol violation and
//! the receiver closes the channel rather than skipping it.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, hash_map::Entry};
use thiserror::Error;

pub type Headers = HashMap<String, String>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TunnelMessage {
    /// Client handshake announcing the port it forwards to.
    Init {
        #[serde(rename = "localPort")]
        local_port: u16,
    },
    /// Relay handshake reply with the public address of the tunnel.
    Ready {
        url: String,
        #[serde(rename = "subdomain", alias = "identifier")]
        identifier: String,
    },
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Response {
        id: String,
        status: u16,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Ping,
    Pong,
}

/// A public request as carried to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<String>,
}

/// A local service reply as carried back to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<String>,
}

/// Flattens an HTTP header map; repeated headers are joined with ", ".
#[must_use]
pub fn headers_from_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes());
        match headers.entry(name.as_str().to_owned()) {
            Entry::Occupied(mut existing) => {
                let joined = existing.get_mut();
                joined.push_str(", ");
                joined.push_str(&value);
            }
            Entry::Vacant(slot) => {
                slot.insert(value.into_owned());
            }
        }
    }
    headers
}

impl TunnelMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }

    #[must_use]
    pub fn request(id: String, request: TunnelRequest) -> Self {
        Self::Request {
            id,
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
        }
    }

    #[must_use]
    pub fn response(id: String, response: TunnelResponse) -> Self {
        Self::Response {
            id,
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }

    /// Wire name of the message, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Ready { .. } => "ready",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn as_json(msg: &TunnelMessage) -> Value {
        serde_json::from_str(&msg.encode().unwrap()).unwrap()
    }

    mod encoding {
        use super::*;

        #[test]
        fn init_uses_camel_case_port() {
            let msg = TunnelMessage::Init { local_port: 3000 };
            assert_eq!(as_json(&msg), json!({"type": "init", "localPort": 3000}));
        }

        #[test]
        fn ready_carries_subdomain() {
            let msg = TunnelMessage::Ready {
                url: "http://abc.tunnel.localhost:8081".into(),
                identifier: "abc".into(),
            };
            assert_eq!(
                as_json(&msg),
                json!({
                    "type": "ready",
                    "url": "http://abc.tunnel.localhost:8081",
                    "subdomain": "abc"
                })
            );
        }

        #[test]
        fn omits_missing_body() {
            let msg = TunnelMessage::request(
                "r1".into(),
                TunnelRequest {
                    method: "GET".into(),
                    path: "/".into(),
                    headers: Headers::new(),
                    body: None,
                },
            );
            let value = as_json(&msg);
            assert_eq!(value["type"], "request");
            assert!(value.get("body").is_none());
        }

        #[test]
        fn keepalive_messages_are_bare_tags() {
            assert_eq!(as_json(&TunnelMessage::Ping), json!({"type": "ping"}));
            assert_eq!(as_json(&TunnelMessage::Pong), json!({"type": "pong"}));
        }
    }

    mod decoding {
        use super::*;

        #[test]
        fn accepts_identifier_alias_in_ready() {
            let msg = TunnelMessage::decode(
                r#"{"type":"ready","url":"http://x.example","identifier":"x"}"#,
            )
            .unwrap();
            assert_eq!(
                msg,
                TunnelMessage::Ready {
                    url: "http://x.example".into(),
                    identifier: "x".into()
                }
            );
        }

        #[test]
        fn response_defaults_headers_and_body() {
            let msg = TunnelMessage::decode(r#"{"type":"response","id":"r1","status":204}"#)
                .unwrap();
            assert_eq!(
                msg,
                TunnelMessage::Response {
                    id: "r1".into(),
                    status: 204,
                    headers: Headers::new(),
                    body: None
                }
            );
        }

        #[test]
        fn rejects_unknown_type() {
            let err = TunnelMessage::decode(r#"{"type":"subscribe"}"#).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedMessage(_)));
        }

        #[test]
        fn rejects_missing_type() {
            assert!(TunnelMessage::decode(r#"{"localPort":3000}"#).is_err());
        }

        #[test]
        fn joins_repeated_headers() {
            let mut map = HeaderMap::new();
            map.append("accept", "text/html".parse().unwrap());
            map.append("accept", "application/json".parse().unwrap());
            map.insert("x-request", "1".parse().unwrap());

            let headers = headers_from_map(&map);
            assert_eq!(headers["accept"], "text/html, application/json");
            assert_eq!(headers["x-request"], "1");
        }

        #[test]
        fn rejects_non_json() {
            assert!(TunnelMessage::decode("ping").is_err());
        }

        #[test]
        fn rejects_wrong_field_types() {
            assert!(TunnelMessage::decode(r#"{"type":"init","localPort":"3000"}"#).is_err());
        }
    }
}
