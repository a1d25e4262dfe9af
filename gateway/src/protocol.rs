//! JSON frames exchanged over the gateway socket.
//!
//! Client frames look like `{"event": "sensor-data", "id": 3, "data": {...}}`.
//! Server frames look like `{"event": "new-sensor-data", "data": {...}}`.

use crate::errors::Result;
use crate::model::FieldMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub const NOT_AUTHORIZED: &str = "not authorized";
pub const SENSOR_NOT_FOUND: &str = "sensor not found";
pub const STORE_FAILED: &str = "failed to store reading";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Error {
        message: String,
    },
    Connected {
        message: String,
        id: i64,
    },
    SensorConnected {
        #[serde(rename = "sensorId")]
        sensor_id: i64,
        #[serde(rename = "nombre")]
        name: String,
        #[serde(rename = "tipo")]
        kind: String,
        timestamp: DateTime<Utc>,
    },
    SensorDisconnected {
        #[serde(rename = "sensorId")]
        sensor_id: i64,
        username: String,
        timestamp: DateTime<Utc>,
    },
    NewSensorData {
        #[serde(rename = "sensorId")]
        sensor_id: i64,
        #[serde(rename = "nombre")]
        name: String,
        #[serde(rename = "tipo")]
        kind: String,
        data: FieldMap,
        timestamp: DateTime<Utc>,
    },
    Ack(Ack),
}

/// Reply to one client frame, echoing its `id` when it had one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub outcome: AckOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AckOutcome {
    Stored {
        success: bool,
        timestamp: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
}

impl AckOutcome {
    pub fn stored(timestamp: DateTime<Utc>) -> Self {
        AckOutcome::Stored {
            success: true,
            timestamp,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        AckOutcome::Failed {
            error: reason.into(),
        }
    }
}

/// What a connection's writer task is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close,
}

/// Sending half of a connection's outbound queue. Unbounded so a slow
/// reader never stalls the sender.
pub type ConnectionHandle = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SensorData(Map<String, Value>),
    Unknown(String),
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_event(self) -> ClientEvent {
        match self.event.as_str() {
            // A non-object payload carries no fields at all.
            "sensor-data" => match self.data {
                Value::Object(map) => ClientEvent::SensorData(map),
                _ => ClientEvent::SensorData(Map::new()),
            },
            _ => ClientEvent::Unknown(self.event),
        }
    }
}
