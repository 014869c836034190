//! Typed access into loose JSON parameter maps.
//!
//! Inference parameters arrive as free-form JSON objects. Backends read
//! individual knobs through [`get`], which returns the caller's requested
//! type when the value is representable (with int/float coercion both
//! ways) and the supplied default otherwise.

use serde_json::{Map, Value};
use tracing::warn;

/// The parameter map carried by every inference request.
pub type Params = Map<String, Value>;

/// Fetch `key` from `params` as a `T`, falling back to `default` when the
/// key is absent or the value cannot be represented as `T`. An
/// unrepresentable value is logged so silent data loss is visible.
pub fn get<T: FromParam>(params: &Params, key: &str, default: T) -> T {
    let Some(value) = params.get(key) else {
        return default;
    };
    match T::from_param(value) {
        Some(v) => v,
        None => {
            warn!(key, %value, "parameter present but not coercible, using default");
            default
        }
    }
}

/// Conversion from a JSON value, with numeric coercions.
pub trait FromParam: Sized {
    fn from_param(value: &Value) -> Option<Self>;
}

impl FromParam for String {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FromParam for bool {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromParam for i64 {
    fn from_param(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }
}

impl FromParam for i32 {
    fn from_param(value: &Value) -> Option<Self> {
        i64::from_param(value).and_then(|v| i32::try_from(v).ok())
    }
}

impl FromParam for u16 {
    fn from_param(value: &Value) -> Option<Self> {
        i64::from_param(value).and_then(|v| u16::try_from(v).ok())
    }
}

impl FromParam for f64 {
    fn from_param(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }
}

impl FromParam for f32 {
    fn from_param(value: &Value) -> Option<Self> {
        f64::from_param(value).map(|v| v as f32)
    }
}
