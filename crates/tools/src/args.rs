//! Typed accessors over the untyped argument map.
//!
//! The guard has already validated presence and type of declared params, so
//! these accessors only fall back to defaults; they never report errors.

use serde_json::Value;

use crate::{ToolArgs, ToolEnvelope, codes};

pub fn str_arg<'a>(args: &'a ToolArgs, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

pub fn bool_arg(args: &ToolArgs, name: &str, default: bool) -> bool {
    args.get(name).and_then(Value::as_bool).unwrap_or(default)
}

/// Integers arrive as JSON integers or integral floats (`2.0`).
pub fn int_arg(args: &ToolArgs, name: &str) -> Option<i64> {
    match args.get(name)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    }
}

pub fn usize_arg(args: &ToolArgs, name: &str, default: usize) -> usize {
    int_arg(args, name)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(default)
}

/// Array of strings; non-string elements are skipped.
pub fn str_list(args: &ToolArgs, name: &str) -> Vec<String> {
    args.get(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Envelope for a required argument that slipped past validation.
pub fn missing(name: &str) -> ToolEnvelope {
    ToolEnvelope::failure(
        codes::INVALID_ARGUMENTS,
        format!("missing required argument '{name}'"),
    )
}
