//! The wire envelope: a single JSON object `{"$ch": "...", "p": ...}`.
//!
//! `$ch` carries the event type, optionally namespaced as
//! `channel_id:type`. `p` is the payload and is omitted entirely for void
//! payloads; decoders accept both shapes. Decoding mirrors the injected
//! client's `_d` function bit for bit: size cap, parse, `__proto__` strip,
//! and the string-`$ch` requirement, all before any schema lookup.

use serde_json::{Map, Value};

/// Default cap on raw message size, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;

/// A decoded wire envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The `$ch` field, still carrying any channel prefix.
    pub channel: String,
    /// The `p` field; `None` when absent on the wire.
    pub payload: Option<Value>,
}

/// Encode an envelope. A non-empty `prefix` namespaces the type as
/// `prefix:type`; a `None` payload omits `p` from the wire object.
pub fn encode(event_type: &str, prefix: &str, payload: Option<Value>) -> String {
    let channel = if prefix.is_empty() {
        event_type.to_string()
    } else {
        format!("{prefix}:{event_type}")
    };
    let mut obj = Map::new();
    obj.insert("$ch".to_string(), Value::String(channel));
    if let Some(p) = payload {
        obj.insert("p".to_string(), p);
    }
    Value::Object(obj).to_string()
}

/// Decode a raw message into an envelope.
///
/// Returns `None` — indistinguishably for the caller — when the message is
/// oversized, unparsable, not an object, or lacks a string `$ch`. Any
/// `__proto__` key anywhere in the parsed value is removed before the
/// envelope is returned.
pub fn decode(raw: &str, max_size: usize) -> Option<Envelope> {
    if raw.len() > max_size {
        return None;
    }
    let mut value: Value = serde_json::from_str(raw).ok()?;
    strip_proto(&mut value);
    let obj = value.as_object_mut()?;
    let channel = match obj.get("$ch") {
        Some(Value::String(s)) => s.clone(),
        _ => return None,
    };
    let payload = obj.remove("p");
    Some(Envelope { channel, payload })
}

/// Remove every `__proto__` own-key from the value, recursively. JSON maps
/// in Rust have no prototype chain, but the wire contract promises the key
/// never reaches schema validation or handlers on either side of the
/// bridge.
pub fn strip_proto(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("__proto__");
            for (_, v) in map.iter_mut() {
                strip_proto(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_proto(v);
            }
        }
        _ => {}
    }
}

/// Split a decoded `$ch` value against the configured prefix. With an empty
/// prefix the channel is returned whole; otherwise the `prefix:` prelude is
/// required and stripped, and a missing or different prelude yields `None`.
pub fn unprefix<'a>(channel: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(channel);
    }
    let rest = channel.strip_prefix(prefix)?;
    rest.strip_prefix(':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_payloads() {
        let raw = encode("ping", "", Some(json!("hi")));
        assert_eq!(raw, r#"{"$ch":"ping","p":"hi"}"#);
        let env = decode(&raw, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(env.channel, "ping");
        assert_eq!(env.payload, Some(json!("hi")));
    }

    #[test]
    fn prefix_is_prepended_and_stripped() {
        let raw = encode("ping", "ns", Some(json!(1)));
        assert_eq!(raw, r#"{"$ch":"ns:ping","p":1}"#);
        let env = decode(&raw, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(unprefix(&env.channel, "ns"), Some("ping"));
        assert_eq!(unprefix("ping", "ns"), None);
        assert_eq!(unprefix("other:ping", "ns"), None);
        assert_eq!(unprefix("ping", ""), Some("ping"));
    }

    #[test]
    fn void_payload_is_omitted_and_accepted() {
        let raw = encode("randomize", "", None);
        assert_eq!(raw, r#"{"$ch":"randomize"}"#);
        let env = decode(&raw, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(env.payload, None);
        // Explicit null p is also accepted.
        let env = decode(r#"{"$ch":"randomize","p":null}"#, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(env.payload, Some(Value::Null));
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let raw = encode("ping", "", Some(json!("x".repeat(64))));
        assert!(decode(&raw, 32).is_none());
        assert!(decode(&raw, 4096).is_some());
    }

    #[test]
    fn envelope_shape_is_enforced() {
        for bad in [
            "not json",
            "42",
            "[1,2]",
            r#"{"p":"no channel"}"#,
            r#"{"$ch":42,"p":1}"#,
            r#"{"$ch":null}"#,
        ] {
            assert!(decode(bad, DEFAULT_MAX_MESSAGE_SIZE).is_none(), "accepted: {bad}");
        }
    }

    #[test]
    fn proto_keys_are_stripped_everywhere() {
        let raw = r#"{"$ch":"ping","p":{"x":1,"__proto__":{"polluted":true},
            "nested":[{"__proto__":1}]}}"#;
        let env = decode(raw, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let p = env.payload.unwrap();
        assert_eq!(p["x"], json!(1));
        assert!(p.get("__proto__").is_none());
        assert!(p["nested"][0].as_object().unwrap().is_empty());
    }
}
