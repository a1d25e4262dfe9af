use crate::model::{FieldMap, FieldType, FieldValue, InputField};
use serde_json::{Map, Value};

/// Coerces a raw sensor payload into the device's declared schema.
///
/// Every declared field appears in the output exactly once, in declaration
/// order. Missing or unparseable values become `FieldValue::Null` and keys
/// not in the schema are dropped. This never fails: one bad field must not
/// cost the whole reading.
pub fn validate(schema: &[InputField], raw: &Map<String, Value>) -> FieldMap {
    let mut out = FieldMap::with_capacity(schema.len());

    for field in schema {
        let value = match raw.get(&field.name) {
            None | Some(Value::Null) => FieldValue::Null,
            Some(value) => coerce(field.field_type, value),
        };
        out.insert(field.name.clone(), value);
    }

    out
}

fn coerce(field_type: FieldType, value: &Value) -> FieldValue {
    let coerced = match field_type {
        FieldType::String => Some(FieldValue::String(stringify(value))),
        FieldType::Bool => to_bool(value).map(FieldValue::Bool),
        FieldType::Int => to_int(value).map(FieldValue::Int),
        FieldType::Float => to_float(value).map(FieldValue::Float),
        FieldType::Unsupported => None,
    };
    coerced.unwrap_or(FieldValue::Null)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 1.0 => Some(true),
            Some(f) if f == 0.0 => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => parse_int_prefix(s),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_float_prefix(s),
        _ => None,
    }
}

/// Parses the leading base-10 integer of `s`, ignoring leading whitespace
/// and any trailing garbage ("42abc" is 42, "3.9" is 3).
fn parse_int_prefix(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return None;
    }

    s[..end].parse().ok()
}

/// Parses the longest leading decimal number of `s` ("21.5 C" is 21.5,
/// "1e3x" is 1000). Non-finite results are treated as unparseable.
fn parse_float_prefix(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }

    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut mantissa_digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        mantissa_digits += frac_end - frac_start;
        if mantissa_digits > 0 {
            end = frac_end;
        }
    }

    if mantissa_digits == 0 {
        return None;
    }

    // Exponent only counts if at least one digit follows it.
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+') | Some(b'-')) {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok().filter(|f| f.is_finite())
}
