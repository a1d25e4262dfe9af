use crate::errors::Result;
use crate::model::{FieldMap, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

/// Filter for reading stored telemetry back, newest first.
#[derive(Debug, Clone, Default)]
pub struct TelemetryFilter {
    pub device_id: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl TelemetryFilter {
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT),
            offset: offset.unwrap_or(0),
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn for_device(device_id: i64) -> Self {
        Self {
            device_id: Some(device_id),
            ..Self::new(None, None)
        }
    }
}

/// Durable, append-only telemetry storage.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Persists one validated reading. The store assigns the timestamp.
    async fn append(&self, device_id: i64, data: &FieldMap) -> Result<TelemetryRecord>;

    async fn query(&self, filter: &TelemetryFilter) -> Result<Vec<TelemetryRecord>>;

    /// Number of records matching the filter's device and time range,
    /// ignoring `limit` and `offset`.
    async fn count(&self, filter: &TelemetryFilter) -> Result<u64>;
}
