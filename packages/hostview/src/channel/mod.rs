//! Host-side typed IPC channel.
//!
//! A [`Channel`] wraps one window and a [`SchemaMap`]. Outgoing payloads
//! are envelope-encoded and posted through the window; incoming raw
//! messages pass a gate pipeline — rate limit, size/parse, namespace
//! prefix, origin, listener lookup, schema allowlist, validation — before
//! the transformed value reaches handlers in insertion order.
//!
//! Every security-relevant rejection (origin mismatch, bad prefix,
//! oversized message, failed parse, rate limit) is silent by design: no
//! host-visible error and no feedback to the page. The one exception is
//! schema validation, which reports through
//! [`ChannelOptions::on_validation_error`] when supplied.

pub mod envelope;
mod rate;
pub mod schema;

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Instant;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::events::PageLoadPhase;
use crate::policy;
use crate::script;
use crate::window::NativeWindow;

pub use envelope::DEFAULT_MAX_MESSAGE_SIZE;
pub use schema::{MessageSchema, SchemaError, SchemaMap};

/// A registered event handler. Identity (`Rc::ptr_eq`) is what
/// [`Channel::off`] removes by, so keep the `Rc` around to deregister.
pub type EventHandler = Rc<dyn Fn(&Value)>;

/// Convenience constructor for an [`EventHandler`].
pub fn handler<F: Fn(&Value) + 'static>(f: F) -> EventHandler {
    Rc::new(f)
}

/// Callback invoked when an incoming payload fails schema validation:
/// `(event_type, original_payload)`.
pub type ValidationErrorHandler = Box<dyn FnMut(&str, &Value)>;

/// Channel namespace configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelId {
    /// No namespace: `$ch` carries the bare event type.
    #[default]
    None,
    /// A random 8-character alphanumeric nonce, generated per channel.
    /// Page code must learn the prefix from the host to speak the channel,
    /// which keeps scripts that did not receive it from forging messages.
    Auto,
    /// A literal prefix; case is preserved.
    Literal(String),
}

/// Configuration for [`Channel::new`]. Everything is optional; the schema
/// map is passed separately because every channel needs one.
#[derive(Default)]
pub struct ChannelOptions {
    /// Install the injected client into pages. Default: true.
    /// When `trusted_origins` is non-empty, installation is deferred and
    /// gated per page load so the bridge is never exposed to an untrusted
    /// origin.
    pub inject_client: Option<bool>,
    /// Invoked when an incoming payload fails schema validation.
    pub on_validation_error: Option<ValidationErrorHandler>,
    /// Origins allowed to send into this channel. Entries are normalized
    /// through the WHATWG URL parser; entries that do not parse or have an
    /// opaque origin are dropped silently. Empty = no origin filtering.
    pub trusted_origins: Vec<String>,
    /// Cap on raw incoming message size in bytes.
    /// Default: [`DEFAULT_MAX_MESSAGE_SIZE`].
    pub max_message_size: Option<usize>,
    /// Incoming messages per second; `None` or zero = unlimited.
    pub rate_limit: Option<u32>,
    /// Cap on registrations per event type; `None` = unlimited.
    pub max_listeners_per_event: Option<usize>,
    /// Namespace prefix for `$ch` values.
    pub channel_id: ChannelId,
}

/// The gate pipeline and listener registry. Kept separate from the window
/// plumbing so every property of the pipeline is testable without a
/// platform back-end.
struct ChannelState {
    schemas: SchemaMap,
    /// Resolved namespace prefix; empty when the channel has none.
    prefix: String,
    /// Normalized trusted origins; empty = no filtering.
    trusted_origins: Vec<String>,
    max_message_size: usize,
    rate: rate::RateLimiter,
    max_listeners: Option<usize>,
    listeners: std::collections::HashMap<String, Vec<EventHandler>>,
    on_validation_error: Option<ValidationErrorHandler>,
}

impl ChannelState {
    /// Register a handler for `event_type`. Unknown types and additions
    /// past the per-event cap drop silently; a handler already present
    /// (by identity) is not added twice.
    fn on(&mut self, event_type: &str, handler: EventHandler) {
        if !self.schemas.contains(event_type) {
            return;
        }
        let set = self.listeners.entry(event_type.to_string()).or_default();
        if set.iter().any(|h| Rc::ptr_eq(h, &handler)) {
            return;
        }
        if let Some(cap) = self.max_listeners {
            if set.len() >= cap {
                return;
            }
        }
        set.push(handler);
    }

    /// Deregister by identity.
    fn off(&mut self, event_type: &str, handler: &EventHandler) {
        if let Some(set) = self.listeners.get_mut(event_type) {
            set.retain(|h| !Rc::ptr_eq(h, handler));
            if set.is_empty() {
                self.listeners.remove(event_type);
            }
        }
    }

    /// Encode an outgoing envelope, or `None` for unknown event types.
    /// Outgoing payloads are NOT validated against the schema — the typed
    /// `send` signature is the contract. This is a deliberate
    /// defense-in-depth gap: a host that constructs payloads dynamically
    /// must validate them itself.
    fn encode_outgoing(&self, event_type: &str, payload: Option<Value>) -> Option<String> {
        if !self.schemas.contains(event_type) {
            return None;
        }
        Some(envelope::encode(event_type, &self.prefix, payload))
    }

    /// Run the incoming gate pipeline. On success returns the handler
    /// snapshot and the schema-transformed value; every rejection returns
    /// `None`, with validation failures additionally reported through
    /// `on_validation_error`.
    fn process(
        &mut self,
        raw: &str,
        source_url: &str,
        now: Instant,
    ) -> Option<(Vec<EventHandler>, Value)> {
        if !self.rate.allow(now) {
            return None;
        }
        let env = envelope::decode(raw, self.max_message_size)?;
        let event_type = envelope::unprefix(&env.channel, &self.prefix)?.to_string();
        if !self.trusted_origins.is_empty() {
            match policy::extract_origin(source_url) {
                Some(origin) if self.trusted_origins.contains(&origin) => {}
                _ => return None, // empty/malformed source URLs are untrusted
            }
        }
        let handlers = self.listeners.get(&event_type)?;
        let schema = self.schemas.get(&event_type)?;
        let payload = env.payload.unwrap_or(Value::Null);
        match schema.safe_parse(&payload) {
            Ok(data) => Some((handlers.clone(), data)),
            Err(_) => {
                if let Some(cb) = self.on_validation_error.as_mut() {
                    cb(&event_type, &payload);
                }
                None
            }
        }
    }
}

/// Invoke each handler in insertion order, isolating panics so one
/// faulting handler cannot prevent the others from running.
fn dispatch(handlers: &[EventHandler], value: &Value) {
    for h in handlers {
        if catch_unwind(AssertUnwindSafe(|| h(value))).is_err() {
            tracing::error!("channel handler panicked; continuing with remaining handlers");
        }
    }
}

/// Generate the 8-character alphanumeric nonce for [`ChannelId::Auto`].
fn auto_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// A typed, hardened message channel over one window's raw IPC bridge.
///
/// Creating a channel claims the window's `on_message` and `on_page_load`
/// handler slots; register page-load interest through a second channel-free
/// window if both are needed.
pub struct Channel {
    window: NativeWindow,
    state: Rc<RefCell<ChannelState>>,
    channel_id: Option<String>,
}

impl Channel {
    /// Create a channel over `window` with the given schema map.
    pub fn new(window: &NativeWindow, schemas: SchemaMap, options: ChannelOptions) -> Result<Self> {
        let trusted_origins: Vec<String> = options
            .trusted_origins
            .iter()
            .filter_map(|o| policy::extract_origin(o))
            .collect();
        let channel_id = match options.channel_id {
            ChannelId::None => None,
            ChannelId::Auto => Some(auto_nonce()),
            ChannelId::Literal(s) => Some(s),
        };
        let max_message_size = options.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        let inject_client = options.inject_client.unwrap_or(true);

        let state = Rc::new(RefCell::new(ChannelState {
            schemas,
            prefix: channel_id.clone().unwrap_or_default(),
            trusted_origins: trusted_origins.clone(),
            max_message_size,
            rate: rate::RateLimiter::new(options.rate_limit),
            max_listeners: options.max_listeners_per_event,
            listeners: std::collections::HashMap::new(),
            on_validation_error: options.on_validation_error,
        }));

        let channel = Self {
            window: window.clone(),
            state,
            channel_id,
        };

        // Incoming messages, with the source URL captured per call.
        let incoming_state = Rc::clone(&channel.state);
        window.on_message(move |raw, source_url| {
            let dispatched = incoming_state
                .borrow_mut()
                .process(raw, source_url, Instant::now());
            if let Some((handlers, value)) = dispatched {
                dispatch(&handlers, &value);
            }
        });

        if inject_client {
            let client = channel.client_script();
            if trusted_origins.is_empty() {
                // No origin restriction: make the client part of every
                // future document and install into the current one.
                window.install_document_start_script(client.clone())?;
                window.evaluate_script_internal(client.clone())?;
            }
            // Re-inject on every navigation; with a trust set the page must
            // prove a matching origin before it ever sees the bridge.
            let reinject_window = window.clone();
            let reinject_origins = trusted_origins;
            window.on_page_load(move |phase, url| {
                if phase != PageLoadPhase::Finished {
                    return;
                }
                if !reinject_origins.is_empty() {
                    match policy::extract_origin(url) {
                        Some(origin) if reinject_origins.contains(&origin) => {}
                        _ => return,
                    }
                }
                let _ = reinject_window.evaluate_script_internal(client.clone());
            });
        }

        Ok(channel)
    }

    /// The resolved namespace prefix, if any. With [`ChannelId::Auto`] this
    /// is how the host learns the nonce to hand to its own page code.
    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// The injected client for this channel's prefix and size cap, for
    /// hosts that bundle the client into their own pages instead of letting
    /// the channel inject it.
    pub fn client_script(&self) -> String {
        let state = self.state.borrow();
        script::client_script(self.channel_id.as_deref(), state.max_message_size)
    }

    /// Send a typed message to the page. Event types outside the schema
    /// map drop silently. The payload is serialized as-is — outgoing
    /// payloads are not validated; the typed signature is the contract.
    pub fn send<T: Serialize + ?Sized>(&self, event_type: &str, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.post(event_type, Some(value))
    }

    /// Send a payload-less message; the envelope omits `p` entirely.
    pub fn send_void(&self, event_type: &str) -> Result<()> {
        self.post(event_type, None)
    }

    fn post(&self, event_type: &str, payload: Option<Value>) -> Result<()> {
        let encoded = self.state.borrow().encode_outgoing(event_type, payload);
        match encoded {
            Some(raw) => self.window.post_message(&raw),
            None => Ok(()),
        }
    }

    /// Register a handler for an event type. Set semantics by handler
    /// identity; insertion order is dispatch order. Unknown event types and
    /// additions past `max_listeners_per_event` drop silently.
    pub fn on(&self, event_type: &str, handler: EventHandler) {
        self.state.borrow_mut().on(event_type, handler);
    }

    /// Deregister a handler by identity.
    pub fn off(&self, event_type: &str, handler: &EventHandler) {
        self.state.borrow_mut().off(event_type, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    /// Route tracing output through the test harness so the pipeline's
    /// warnings (panicking handlers, dropped messages) show up under
    /// `--nocapture`. Safe to call from every test; only the first
    /// initialization wins.
    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    }

    fn state(schemas: SchemaMap) -> ChannelState {
        ChannelState {
            schemas,
            prefix: String::new(),
            trusted_origins: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            rate: rate::RateLimiter::new(None),
            max_listeners: None,
            listeners: std::collections::HashMap::new(),
            on_validation_error: None,
        }
    }

    fn ping_schemas() -> SchemaMap {
        SchemaMap::new().with::<String>("ping")
    }

    /// Collects dispatched values for assertions.
    fn recording_handler() -> (EventHandler, Rc<RefCell<Vec<Value>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        (handler(move |v| seen2.borrow_mut().push(v.clone())), seen)
    }

    fn run(state: &mut ChannelState, raw: &str, source: &str) {
        if let Some((handlers, value)) = state.process(raw, source, Instant::now()) {
            dispatch(&handlers, &value);
        }
    }

    #[test]
    fn basic_send_receive() {
        let mut st = state(ping_schemas());
        let (h, seen) = recording_handler();
        st.on("ping", h);

        // Outgoing: envelope matches the wire contract exactly.
        assert_eq!(
            st.encode_outgoing("ping", Some(json!("hi"))).unwrap(),
            r#"{"$ch":"ping","p":"hi"}"#
        );
        // Incoming: the handler sees exactly "hi".
        run(&mut st, r#"{"$ch":"ping","p":"hi"}"#, "https://app.local/a");
        assert_eq!(*seen.borrow(), vec![json!("hi")]);
    }

    #[test]
    fn namespace_isolation() {
        let mut st = state(ping_schemas());
        st.prefix = "ns".to_string();
        let (h, seen) = recording_handler();
        st.on("ping", h);

        run(&mut st, r#"{"$ch":"ping","p":"x"}"#, "https://app.local/");
        assert!(seen.borrow().is_empty());
        run(&mut st, r#"{"$ch":"ns:ping","p":"x"}"#, "https://app.local/");
        assert_eq!(*seen.borrow(), vec![json!("x")]);
        // Outgoing gets the prefix.
        assert_eq!(
            st.encode_outgoing("ping", Some(json!("x"))).unwrap(),
            r#"{"$ch":"ns:ping","p":"x"}"#
        );
    }

    #[test]
    fn origin_gate() {
        let mut st = state(ping_schemas());
        // Entries normalize at channel construction; this mirrors it.
        st.trusted_origins = vec![policy::extract_origin("HTTPS://APP.LOCAL").unwrap()];
        let (h, seen) = recording_handler();
        st.on("ping", h);

        run(&mut st, r#"{"$ch":"ping","p":"a"}"#, "https://evil.com/");
        run(&mut st, r#"{"$ch":"ping","p":"b"}"#, "");
        run(&mut st, r#"{"$ch":"ping","p":"c"}"#, "not a url");
        assert!(seen.borrow().is_empty());
        run(&mut st, r#"{"$ch":"ping","p":"d"}"#, "https://app.local/page");
        assert_eq!(*seen.borrow(), vec![json!("d")]);
    }

    #[test]
    fn rate_limit_caps_bursts() {
        let mut st = state(ping_schemas());
        st.rate = rate::RateLimiter::new(Some(3));
        let (h, seen) = recording_handler();
        st.on("ping", h);

        let now = Instant::now();
        for i in 0..5 {
            let raw = format!(r#"{{"$ch":"ping","p":"m{i}"}}"#);
            if let Some((handlers, value)) = st.process(&raw, "https://a.b/", now) {
                dispatch(&handlers, &value);
            }
        }
        assert_eq!(
            *seen.borrow(),
            vec![json!("m0"), json!("m1"), json!("m2")]
        );
        // 1.1s later the window has slid.
        let later = now + Duration::from_millis(1100);
        if let Some((handlers, value)) =
            st.process(r#"{"$ch":"ping","p":"m5"}"#, "https://a.b/", later)
        {
            dispatch(&handlers, &value);
        }
        assert_eq!(seen.borrow().len(), 4);
    }

    #[test]
    fn prototype_pollution_is_stripped_before_validation() {
        #[derive(serde::Deserialize, serde::Serialize)]
        struct Payload {
            x: f64,
        }
        let mut st = state(SchemaMap::new().with::<Payload>("ping"));
        let (h, seen) = recording_handler();
        st.on("ping", h);

        run(
            &mut st,
            r#"{"$ch":"ping","p":{"x":1,"__proto__":{"polluted":true}}}"#,
            "https://app.local/",
        );
        assert_eq!(*seen.borrow(), vec![json!({"x": 1.0})]);
    }

    #[test]
    fn void_events_round_trip_without_payload() {
        let mut st = state(SchemaMap::new().with_void("randomize"));
        let (h, seen) = recording_handler();
        st.on("randomize", h);

        assert_eq!(
            st.encode_outgoing("randomize", None).unwrap(),
            r#"{"$ch":"randomize"}"#
        );
        run(&mut st, r#"{"$ch":"randomize"}"#, "https://app.local/");
        assert_eq!(*seen.borrow(), vec![Value::Null]);
    }

    #[test]
    fn listener_ops_are_idempotent() {
        let mut st = state(ping_schemas());
        let (h, seen) = recording_handler();
        st.on("ping", Rc::clone(&h));
        st.on("ping", Rc::clone(&h));
        run(&mut st, r#"{"$ch":"ping","p":"once"}"#, "https://a.b/");
        assert_eq!(seen.borrow().len(), 1);

        st.off("ping", &h);
        run(&mut st, r#"{"$ch":"ping","p":"gone"}"#, "https://a.b/");
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn unknown_types_drop_silently_both_ways() {
        let mut st = state(ping_schemas());
        let (h, seen) = recording_handler();
        // Registration for an unknown type is a no-op...
        st.on("mystery", Rc::clone(&h));
        assert!(st.listeners.is_empty());
        // ...outgoing unknown types encode to nothing...
        assert!(st.encode_outgoing("mystery", Some(json!(1))).is_none());
        // ...and incoming unknown types never dispatch.
        st.on("ping", h);
        run(&mut st, r#"{"$ch":"mystery","p":1}"#, "https://a.b/");
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn max_listeners_cap_drops_additions() {
        let mut st = state(ping_schemas());
        st.max_listeners = Some(2);
        let (h1, s1) = recording_handler();
        let (h2, s2) = recording_handler();
        let (h3, s3) = recording_handler();
        st.on("ping", h1);
        st.on("ping", h2);
        st.on("ping", h3); // over the cap, dropped
        run(&mut st, r#"{"$ch":"ping","p":"x"}"#, "https://a.b/");
        assert_eq!(s1.borrow().len(), 1);
        assert_eq!(s2.borrow().len(), 1);
        assert!(s3.borrow().is_empty());
    }

    #[test]
    fn validation_failure_reports_original_payload() {
        let errors: Rc<RefCell<Vec<(String, Value)>>> = Rc::new(RefCell::new(Vec::new()));
        let errors2 = Rc::clone(&errors);
        let mut st = state(ping_schemas());
        st.on_validation_error = Some(Box::new(move |ty, payload| {
            errors2.borrow_mut().push((ty.to_string(), payload.clone()));
        }));
        let (h, seen) = recording_handler();
        st.on("ping", h);

        run(&mut st, r#"{"$ch":"ping","p":{"not":"a string"}}"#, "https://a.b/");
        assert!(seen.borrow().is_empty());
        assert_eq!(
            *errors.borrow(),
            vec![("ping".to_string(), json!({"not": "a string"}))]
        );
    }

    #[test]
    fn handler_panic_does_not_cancel_siblings() {
        init_tracing();
        let mut st = state(ping_schemas());
        let panicking = handler(|_| panic!("boom"));
        let (h, seen) = recording_handler();
        st.on("ping", panicking);
        st.on("ping", h);
        run(&mut st, r#"{"$ch":"ping","p":"still here"}"#, "https://a.b/");
        assert_eq!(*seen.borrow(), vec![json!("still here")]);
    }

    #[test]
    fn dispatch_order_is_insertion_order() {
        let mut st = state(ping_schemas());
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order2 = Rc::clone(&order);
            st.on("ping", handler(move |_| order2.borrow_mut().push(tag)));
        }
        run(&mut st, r#"{"$ch":"ping","p":"x"}"#, "https://a.b/");
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn auto_nonce_shape() {
        let a = auto_nonce();
        let b = auto_nonce();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        // Two nonces colliding is astronomically unlikely; a collision here
        // almost certainly means the generator is broken.
        assert_ne!(a, b);
    }
}
