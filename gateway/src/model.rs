use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Declared type of one field in a device's input schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Bool,
    Int,
    Float,
    /// Any tag we do not know how to coerce. Always validates to null.
    #[serde(other)]
    Unsupported,
}

/// One entry of a device's declared input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    #[serde(alias = "nombre")]
    pub name: String,
    #[serde(rename = "type", alias = "tipo")]
    pub field_type: FieldType,
}

impl InputField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A telemetry-producing principal as seen by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub kind: String,
    pub inputs: Vec<InputField>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

/// A dashboard user.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringPrincipal {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub role: UserRole,
}

/// A single validated value. Serializes as a bare JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Null,
}

impl From<&FieldValue> for serde_json::Value {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::String(s) => serde_json::Value::String(s.clone()),
            FieldValue::Null => serde_json::Value::Null,
        }
    }
}

/// Schema-shaped, ordered mapping of field name to validated value.
pub type FieldMap = IndexMap<String, FieldValue>;

/// One stored reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(rename = "sensorId")]
    pub device_id: i64,
    pub data: FieldMap,
    pub timestamp: DateTime<Utc>,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    pub data: Vec<TelemetryRecord>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}
