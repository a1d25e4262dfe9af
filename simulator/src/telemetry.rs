use anyhow::{bail, Context};
use rand::Rng;
use serde_json::{Map, Number, Value};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Bool,
    Int,
    Float,
}

impl FromStr for FieldKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" => Ok(FieldKind::String),
            "bool" => Ok(FieldKind::Bool),
            "int" => Ok(FieldKind::Int),
            "float" => Ok(FieldKind::Float),
            other => bail!("unknown field type '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Parses `name:type,name:type`.
pub fn parse_fields(spec: &str) -> anyhow::Result<Vec<FieldSpec>> {
    let mut fields = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, kind) = part
            .split_once(':')
            .with_context(|| format!("field '{}' is missing a type", part))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("field '{}' has an empty name", part);
        }
        fields.push(FieldSpec {
            name: name.to_string(),
            kind: kind.parse()?,
        });
    }
    if fields.is_empty() {
        bail!("at least one field is required");
    }
    Ok(fields)
}

/// Builds one `sensor-data` payload. With probability `malformed_rate` a
/// field is sent as text, as junk, or left out.
pub fn generate_reading(
    rng: &mut impl Rng,
    fields: &[FieldSpec],
    malformed_rate: f64,
) -> Map<String, Value> {
    let mut reading = Map::new();
    for field in fields {
        let value = normal_value(rng, field.kind);
        if rng.gen_bool(malformed_rate.clamp(0.0, 1.0)) {
            match rng.gen_range(0..3) {
                0 => {
                    reading.insert(field.name.clone(), Value::String(text_of(&value)));
                }
                1 => {
                    reading.insert(field.name.clone(), Value::String("n/a".to_string()));
                }
                _ => {}
            }
        } else {
            reading.insert(field.name.clone(), value);
        }
    }
    reading
}

fn normal_value(rng: &mut impl Rng, kind: FieldKind) -> Value {
    match kind {
        FieldKind::String => Value::String(format!("status-{}", rng.gen_range(0..5))),
        FieldKind::Bool => Value::Bool(rng.gen_bool(0.9)),
        FieldKind::Int => Value::from(rng.gen_range(0..100)),
        FieldKind::Float => {
            // 5% outliers
            let v: f64 = if rng.gen_bool(0.05) {
                rng.gen_range(-50.0..100.0)
            } else {
                rng.gen_range(15.0..35.0)
            };
            Number::from_f64((v * 100.0).round() / 100.0)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
