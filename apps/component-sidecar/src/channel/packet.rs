//! Engine.IO v4 / Socket.IO v5 text packets, the subset a client on the
//! default namespace needs.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Body of the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect. Client side carries the auth object, server
    /// side carries `{sid}`.
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unsupported packet type {0:?}")]
    UnknownType(String),
    #[error("binary packets are not supported")]
    Binary,
    #[error("invalid packet json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event packet without a name")]
    MissingEventName,
    #[error("ack packet without an id")]
    MissingAckId,
}

impl Packet {
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();
        match kind {
            '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '6' => Ok(Packet::Noop),
            '4' => decode_message(rest),
            other => Err(PacketError::UnknownType(other.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(handshake) => format!(
                "0{{\"sid\":{},\"pingInterval\":{},\"pingTimeout\":{}}}",
                Value::String(handshake.sid.clone()),
                handshake.ping_interval,
                handshake.ping_timeout
            ),
            Packet::Close => "1".into(),
            Packet::Ping => "2".into(),
            Packet::Pong => "3".into(),
            Packet::Noop => "6".into(),
            Packet::Connect(None) => "40".into(),
            Packet::Connect(Some(data)) => format!("40{data}"),
            Packet::Disconnect => "41".into(),
            Packet::Event { id, name, args } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                let id = id.map(|id| id.to_string()).unwrap_or_default();
                format!("42{id}{}", Value::Array(items))
            }
            Packet::Ack { id, args } => format!("43{id}{}", Value::Array(args.clone())),
            Packet::ConnectError(data) => format!("44{data}"),
        }
    }
}

fn decode_message(body: &str) -> Result<Packet, PacketError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let rest = strip_namespace(chars.as_str());
    match kind {
        '0' => Ok(Packet::Connect(optional_json(rest)?)),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let (id, data) = split_ack_id(rest);
            let mut items = match serde_json::from_str::<Value>(data)? {
                Value::Array(items) => items.into_iter(),
                _ => return Err(PacketError::MissingEventName),
            };
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => return Err(PacketError::MissingEventName),
            };
            Ok(Packet::Event {
                id,
                name,
                args: items.collect(),
            })
        }
        '3' => {
            let (id, data) = split_ack_id(rest);
            let id = id.ok_or(PacketError::MissingAckId)?;
            let args = match serde_json::from_str::<Value>(data)? {
                Value::Array(items) => items,
                other => vec![other],
            };
            Ok(Packet::Ack { id, args })
        }
        '4' => Ok(Packet::ConnectError(
            optional_json(rest)?.unwrap_or(Value::Null),
        )),
        '5' | '6' => Err(PacketError::Binary),
        other => Err(PacketError::UnknownType(format!("4{other}"))),
    }
}

// Only the default namespace is used; a `/nsp,` prefix is skipped.
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(idx) => &body[idx + 1..],
            None => "",
        }
    } else {
        body
    }
}

fn split_ack_id(body: &str) -> (Option<u64>, &str) {
    let digits = body.len() - body.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return (None, body);
    }
    (body[..digits].parse().ok(), &body[digits..])
}

fn optional_json(body: &str) -> Result<Option<Value>, PacketError> {
    if body.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::from_str(body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_open_handshake() {
        let packet = Packet::decode(
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .expect("open");
        let Packet::Open(handshake) = packet else {
            panic!("expected open, got {packet:?}");
        };
        assert_eq!(handshake.sid, "abc");
        assert_eq!(handshake.ping_interval, 25_000);
        assert_eq!(handshake.max_payload, Some(1_000_000));
    }

    #[test]
    fn decodes_command_event_with_ack_id() {
        let packet =
            Packet::decode(r#"4212["command",{"cmdId":"c1","type":"STOP"}]"#).expect("event");
        assert_eq!(
            packet,
            Packet::Event {
                id: Some(12),
                name: "command".into(),
                args: vec![json!({"cmdId": "c1", "type": "STOP"})],
            }
        );
    }

    #[test]
    fn skips_namespace_prefix() {
        let packet = Packet::decode(r#"42/admin,7["command",{}]"#).expect("event");
        assert!(matches!(packet, Packet::Event { id: Some(7), .. }));
    }

    #[test]
    fn decodes_connect_and_connect_error() {
        assert_eq!(
            Packet::decode(r#"40{"sid":"s"}"#).expect("connect"),
            Packet::Connect(Some(json!({"sid": "s"})))
        );
        assert_eq!(
            Packet::decode(r#"44{"message":"invalid token"}"#).expect("connect error"),
            Packet::ConnectError(json!({"message": "invalid token"}))
        );
        assert_eq!(Packet::decode("41").expect("disconnect"), Packet::Disconnect);
    }

    #[test]
    fn encodes_client_packets() {
        assert_eq!(
            Packet::Connect(Some(json!({"token": "t"}))).encode(),
            r#"40{"token":"t"}"#
        );
        assert_eq!(
            Packet::Event {
                id: None,
                name: "status-updates".into(),
                args: vec![json!({"a": 1})],
            }
            .encode(),
            r#"42["status-updates",{"a":1}]"#
        );
        assert_eq!(
            Packet::Ack {
                id: 3,
                args: vec![json!({"cmdId": "c1"})],
            }
            .encode(),
            r#"433[{"cmdId":"c1"}]"#
        );
        assert_eq!(Packet::Pong.encode(), "3");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(Packet::decode(""), Err(PacketError::Empty)));
        assert!(matches!(Packet::decode("9"), Err(PacketError::UnknownType(_))));
        assert!(matches!(
            Packet::decode("42[1,2]"),
            Err(PacketError::MissingEventName)
        ));
        assert!(matches!(Packet::decode("43[]"), Err(PacketError::MissingAckId)));
        assert!(matches!(Packet::decode("42not json"), Err(PacketError::Json(_))));
    }
}
