//! Minimal canonical JSON encoder.
//!
//! Hashed and persisted payloads must be byte-stable across releases, so the
//! encoder is deliberately small instead of delegating to a generic
//! serializer: object keys are emitted in the order the caller pushes them,
//! there is no inter-token whitespace, and strings escape only what JSON
//! requires (`"`, `\`, and control characters as `\u00XX`). Non-ASCII text
//! passes through as UTF-8.

use crate::errors::{ErrorInfo, TiraError};

/// A JSON value the canonical encoder knows how to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonValue {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// Finite JSON number.
    Float(f64),
    /// JSON string.
    Str(String),
    /// JSON array.
    Array(Vec<CanonValue>),
}

impl CanonValue {
    fn write(&self, out: &mut String) -> Result<(), TiraError> {
        match self {
            CanonValue::Null => out.push_str("null"),
            CanonValue::Bool(true) => out.push_str("true"),
            CanonValue::Bool(false) => out.push_str("false"),
            CanonValue::Float(value) => {
                if !value.is_finite() {
                    return Err(TiraError::InvalidArgument(
                        ErrorInfo::new("tira_core.canon_number", "non-finite number in payload")
                            .with("value", value.to_string()),
                    ));
                }
                // f64 Display is shortest round-trip decimal, never exponent
                // notation, so the output is always a valid JSON number.
                out.push_str(&value.to_string());
            }
            CanonValue::Str(text) => write_escaped(text, out),
            CanonValue::Array(items) => {
                out.push('[');
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    item.write(out)?;
                }
                out.push(']');
            }
        }
        Ok(())
    }
}

/// A JSON object whose keys are emitted in insertion order.
#[derive(Debug, Clone, Default)]
pub struct CanonObject {
    fields: Vec<(&'static str, CanonValue)>,
}

impl CanonObject {
    /// Creates an empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field; key order is the emission order.
    pub fn field(mut self, key: &'static str, value: CanonValue) -> Self {
        self.fields.push((key, value));
        self
    }

    /// Emits the object as a compact JSON string.
    pub fn to_string(&self) -> Result<String, TiraError> {
        let mut out = String::new();
        out.push('{');
        for (idx, (key, value)) in self.fields.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            write_escaped(key, &mut out);
            out.push(':');
            value.write(&mut out)?;
        }
        out.push('}');
        Ok(out)
    }

    /// Emits the object as compact UTF-8 JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TiraError> {
        self.to_string().map(String::into_bytes)
    }
}

fn write_escaped(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
