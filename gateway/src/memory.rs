//! In-memory stores and fixtures for tests.

use crate::errors::{Error, Result};
use crate::identity::IdentityStore;
use crate::model::{
    Device, FieldMap, FieldType, InputField, MonitoringPrincipal, TelemetryRecord, UserRole,
};
use crate::telemetry::{TelemetryFilter, TelemetryStore};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const SENSOR_SECRET: &str = "test-sensor-secret";
pub const DASHBOARD_SECRET: &str = "test-dashboard-secret";

pub fn sample_device(id: i64) -> Device {
    Device {
        id,
        name: format!("Sensor {id}"),
        username: format!("sensor-{id}"),
        kind: "thermo".to_string(),
        inputs: vec![
            InputField::new("temp", FieldType::Float),
            InputField::new("ok", FieldType::Bool),
        ],
        active: true,
    }
}

pub fn sample_user(id: i64) -> MonitoringPrincipal {
    MonitoringPrincipal {
        id,
        username: format!("user-{id}"),
        name: format!("User {id}"),
        role: UserRole::User,
    }
}

/// Signs an HS256 token for `sub` that expires `ttl_secs` from now.
pub fn mint_token(secret: &str, sub: i64, ttl_secs: i64) -> String {
    let claims = json!({
        "sub": sub,
        "username": format!("principal-{sub}"),
        "exp": Utc::now().timestamp() + ttl_secs,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[derive(Default)]
pub struct InMemoryIdentityStore {
    devices: Mutex<HashMap<i64, Device>>,
    users: Mutex<HashMap<i64, MonitoringPrincipal>>,
    fail: AtomicBool,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_device(&self, device: Device) {
        self.devices.lock().unwrap().insert(device.id, device);
    }

    pub fn insert_user(&self, user: MonitoringPrincipal) {
        self.users.lock().unwrap().insert(user.id, user);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("identity store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_device(&self, id: i64) -> Result<Option<Device>> {
        self.check()?;
        Ok(self.devices.lock().unwrap().get(&id).cloned())
    }

    async fn find_user(&self, id: i64) -> Result<Option<MonitoringPrincipal>> {
        self.check()?;
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryTelemetryStore {
    records: Mutex<Vec<TelemetryRecord>>,
    fail: AtomicBool,
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

fn matches(filter: &TelemetryFilter, record: &TelemetryRecord) -> bool {
    filter.device_id.map_or(true, |id| record.device_id == id)
        && filter.start.map_or(true, |start| record.timestamp >= start)
        && filter.end.map_or(true, |end| record.timestamp <= end)
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn append(&self, device_id: i64, data: &FieldMap) -> Result<TelemetryRecord> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("telemetry store offline".to_string()));
        }
        let record = TelemetryRecord {
            device_id,
            data: data.clone(),
            timestamp: Utc::now(),
        };
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn query(&self, filter: &TelemetryFilter) -> Result<Vec<TelemetryRecord>> {
        let records = self.records.lock().unwrap();
        let mut found: Vec<TelemetryRecord> = records
            .iter()
            .filter(|r| matches(filter, r))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(found
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn count(&self, filter: &TelemetryFilter) -> Result<u64> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().filter(|r| matches(filter, r)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_query_filters_and_pages() {
        let store = InMemoryTelemetryStore::new();
        for _ in 0..3 {
            store.append(1, &FieldMap::new()).await.unwrap();
        }
        store.append(2, &FieldMap::new()).await.unwrap();

        let mut filter = TelemetryFilter::new(Some(2), None);
        filter.device_id = Some(1);
        assert_eq!(store.query(&filter).await.unwrap().len(), 2);

        filter.offset = 2;
        assert_eq!(store.query(&filter).await.unwrap().len(), 1);

        filter.offset = 0;
        filter.end = Some(Utc::now() - Duration::hours(1));
        assert!(store.query(&filter).await.unwrap().is_empty());

        assert_eq!(store.count(&filter).await.unwrap(), 0);
        assert_eq!(store.count(&TelemetryFilter::for_device(1)).await.unwrap(), 3);
        assert_eq!(store.count(&TelemetryFilter::for_device(2)).await.unwrap(), 1);
        assert_eq!(store.count(&TelemetryFilter::default()).await.unwrap(), 4);
    }
}
