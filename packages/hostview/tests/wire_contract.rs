//! Wire-level contracts: the envelope format and the injected client are
//! external interfaces consumed by page-side code, so their byte-level
//! layout is pinned here with literal assertions.

use hostview::channel::envelope::{self, DEFAULT_MAX_MESSAGE_SIZE};
use hostview::channel::schema::typed;
use hostview::channel::{MessageSchema, SchemaMap};
use hostview::client_script;
use hostview::cookies::{parse_cookies, SameSite, SESSION_EXPIRES};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[test]
fn envelope_round_trip_over_schema_pairs() {
    let cases: Vec<(&str, Value)> = vec![
        ("ping", json!("hi")),
        ("count", json!(42)),
        ("point", json!({"x": 1.5, "y": -2.0})),
        ("items", json!([1, 2, 3])),
        ("flag", json!(true)),
        ("nothing", Value::Null),
    ];
    for prefix in ["", "ns", "a1B2c3D4"] {
        for (ty, payload) in &cases {
            let raw = envelope::encode(ty, prefix, Some(payload.clone()));
            let env = envelope::decode(&raw, DEFAULT_MAX_MESSAGE_SIZE)
                .unwrap_or_else(|| panic!("decode failed for {raw}"));
            assert_eq!(envelope::unprefix(&env.channel, prefix), Some(*ty));
            assert_eq!(env.payload.as_ref(), Some(payload));
        }
    }
}

#[test]
fn envelope_field_layout_is_stable() {
    // The injected client parses these exact shapes; field order and names
    // must not drift.
    assert_eq!(
        envelope::encode("ping", "", Some(json!("hi"))),
        r#"{"$ch":"ping","p":"hi"}"#
    );
    assert_eq!(
        envelope::encode("ping", "ns", Some(json!("hi"))),
        r#"{"$ch":"ns:ping","p":"hi"}"#
    );
    assert_eq!(envelope::encode("randomize", "", None), r#"{"$ch":"randomize"}"#);
}

#[test]
fn schema_transforms_survive_validation() {
    #[derive(Deserialize, Serialize)]
    struct Settings {
        #[serde(rename = "colour")]
        color: String,
        #[serde(default = "default_scale")]
        scale: u32,
    }
    fn default_scale() -> u32 {
        100
    }

    let map = SchemaMap::new().with::<Settings>("settings");
    let out = map
        .get("settings")
        .unwrap()
        .safe_parse(&json!({"colour": "red"}))
        .unwrap();
    assert_eq!(out, json!({"colour": "red", "scale": 100}));
}

#[test]
fn typed_adapter_is_reusable_outside_a_map() {
    let schema = typed::<Vec<String>>();
    assert!(schema.safe_parse(&json!(["a", "b"])).is_ok());
    assert!(schema.safe_parse(&json!([1, 2])).is_err());
}

#[test]
fn client_script_hardening_substrings() {
    let script = client_script(Some("nonce123"), DEFAULT_MAX_MESSAGE_SIZE);

    // Captured prototypes, before any page-observable action.
    for capture in [
        "Array.prototype.slice",
        "Array.prototype.filter",
        "Array.prototype.push",
        "Array.prototype.indexOf",
        "Array.prototype.splice",
        "JSON.stringify",
        "JSON.parse",
        "Object.defineProperty",
        "Object.freeze",
        "Object.create",
    ] {
        assert!(script.contains(capture), "client must capture {capture}");
    }

    // Locked installs: one defineProperty per global, value prepared first.
    assert_eq!(script.matches("writable: false, configurable: false").count(), 3);
    for global in ["__native_message__", "__channel__", "__native_message_listeners__"] {
        assert!(script.contains(global), "missing global {global}");
    }

    // Size-limit constant and prototype-pollution strip.
    assert!(script.contains("var _max = 1048576;"));
    assert!(script.contains("delete v[\"__proto__\"]"));

    // Channel prefix is baked in.
    assert!(script.contains("var _pfx = \"nonce123\";"));
}

#[test]
fn client_script_external_listener_contract() {
    let script = client_script(None, DEFAULT_MAX_MESSAGE_SIZE);
    // add() appends only functions; remove() splices by identity — both via
    // the captured prototype methods, never the array's own.
    assert!(script.contains("if (typeof fn === \"function\") _push.call(_el, fn)"));
    assert!(script.contains("_indexOf.call(_el, fn)"));
    assert!(script.contains("_splice.call(_el, i, 1)"));
}

#[test]
fn cookie_record_shape_matches_contract() {
    let json = r#"[
        {"name":"sid","value":"s3cret","domain":".app.local","path":"/",
         "httpOnly":true,"secure":true,"sameSite":"strict","expires":1924992000},
        {"name":"tmp","value":"1","domain":"app.local","path":"/x",
         "httpOnly":false,"secure":false,"sameSite":"none","expires":-1}
    ]"#;
    let cookies = parse_cookies(json).unwrap();
    assert_eq!(cookies.len(), 2);
    assert_eq!(cookies[0].same_site, SameSite::Strict);
    assert!(cookies[0].http_only);
    assert_eq!(cookies[1].expires, SESSION_EXPIRES);
    assert_eq!(cookies[1].path, "/x");
}
