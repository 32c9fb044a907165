//! Schema adapters for typed-channel validation.
//!
//! A schema is the one-method capability [`MessageSchema::safe_parse`]:
//! validate a payload and return the (possibly transformed) value that
//! handlers receive. Any schema library can sit behind it via an adapter;
//! the built-ins cover the common cases — serde types, void events, a
//! pass-through, and ad-hoc closures.

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Why a payload failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError(pub String);

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate-and-transform capability for one event type.
///
/// `safe_parse` never panics: it returns the transformed output value on
/// success and an error otherwise. Schemas may transform input — handlers
/// always receive the returned value, not the wire payload.
pub trait MessageSchema {
    fn safe_parse(&self, payload: &Value) -> Result<Value, SchemaError>;
}

/// Serde-backed schema: the payload must deserialize as `T`. The
/// deserialization is the transform — serde defaults, renames, and ignored
/// fields are preserved by re-serializing the typed value.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> MessageSchema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize,
{
    fn safe_parse(&self, payload: &Value) -> Result<Value, SchemaError> {
        let typed: T = serde_json::from_value(payload.clone())
            .map_err(|e| SchemaError(e.to_string()))?;
        serde_json::to_value(&typed).map_err(|e| SchemaError(e.to_string()))
    }
}

/// Schema for events that carry no payload. Accepts only an absent or
/// `null` payload.
pub struct VoidSchema;

impl MessageSchema for VoidSchema {
    fn safe_parse(&self, payload: &Value) -> Result<Value, SchemaError> {
        if payload.is_null() {
            Ok(Value::Null)
        } else {
            Err(SchemaError("expected no payload".to_string()))
        }
    }
}

/// Pass-through schema: any JSON payload is accepted unchanged.
pub struct RawSchema;

impl MessageSchema for RawSchema {
    fn safe_parse(&self, payload: &Value) -> Result<Value, SchemaError> {
        Ok(payload.clone())
    }
}

impl<F> MessageSchema for F
where
    F: Fn(&Value) -> Result<Value, SchemaError>,
{
    fn safe_parse(&self, payload: &Value) -> Result<Value, SchemaError> {
        self(payload)
    }
}

/// Serde-backed schema for `T`.
pub fn typed<T: DeserializeOwned + Serialize>() -> TypedSchema<T> {
    TypedSchema {
        _marker: PhantomData,
    }
}

/// Mapping from event-type strings to schemas. The set of keys is the
/// channel's allowlist: unknown types are dropped on both directions.
#[derive(Default)]
pub struct SchemaMap {
    inner: HashMap<String, Box<dyn MessageSchema>>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serde-typed event.
    pub fn with<T>(self, event_type: &str) -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        self.with_schema(event_type, typed::<T>())
    }

    /// Register a payload-less event.
    pub fn with_void(self, event_type: &str) -> Self {
        self.with_schema(event_type, VoidSchema)
    }

    /// Register an event that accepts any JSON payload.
    pub fn with_raw(self, event_type: &str) -> Self {
        self.with_schema(event_type, RawSchema)
    }

    /// Register an event with an arbitrary schema adapter.
    pub fn with_schema<S: MessageSchema + 'static>(mut self, event_type: &str, schema: S) -> Self {
        self.inner.insert(event_type.to_string(), Box::new(schema));
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.inner.contains_key(event_type)
    }

    pub fn get(&self, event_type: &str) -> Option<&dyn MessageSchema> {
        self.inner.get(event_type).map(|b| b.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, Serialize)]
    struct Point {
        x: f64,
        #[serde(default)]
        y: f64,
    }

    #[test]
    fn typed_schema_validates_and_transforms() {
        let map = SchemaMap::new().with::<Point>("point");
        let schema = map.get("point").unwrap();
        // serde default fills in the transform output.
        let out = schema.safe_parse(&json!({"x": 1.0})).unwrap();
        assert_eq!(out, json!({"x": 1.0, "y": 0.0}));
        assert!(schema.safe_parse(&json!({"y": 2.0})).is_err());
        assert!(schema.safe_parse(&json!("nope")).is_err());
    }

    #[test]
    fn void_schema_accepts_only_null() {
        let schema = VoidSchema;
        assert_eq!(schema.safe_parse(&Value::Null).unwrap(), Value::Null);
        assert!(schema.safe_parse(&json!(0)).is_err());
        assert!(schema.safe_parse(&json!({})).is_err());
    }

    #[test]
    fn closure_adapter_satisfies_the_contract() {
        let uppercase = |v: &Value| -> Result<Value, SchemaError> {
            v.as_str()
                .map(|s| Value::String(s.to_uppercase()))
                .ok_or_else(|| SchemaError("expected string".into()))
        };
        let map = SchemaMap::new().with_schema("shout", uppercase);
        let out = map.get("shout").unwrap().safe_parse(&json!("hi")).unwrap();
        assert_eq!(out, json!("HI"));
    }

    #[test]
    fn keys_are_the_allowlist() {
        let map = SchemaMap::new().with::<String>("ping").with_void("randomize");
        assert!(map.contains("ping"));
        assert!(map.contains("randomize"));
        assert!(!map.contains("other"));
    }
}
