use crate::errors::{Error, Result};
use crate::identity::IdentityStore;
use crate::metrics::DB_RETRIES_TOTAL;
use crate::model::{Device, FieldMap, InputField, MonitoringPrincipal, TelemetryRecord, UserRole};
use crate::telemetry::{TelemetryFilter, TelemetryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::QueryBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_APPEND_ATTEMPTS: u32 = 3;

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: i64,
    name: String,
    username: String,
    kind: String,
    inputs: Json<Vec<InputField>>,
    active: bool,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            id: row.id,
            name: row.name,
            username: row.username,
            kind: row.kind,
            inputs: row.inputs.0,
            active: row.active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    name: String,
    role: String,
}

impl From<UserRow> for MonitoringPrincipal {
    fn from(row: UserRow) -> Self {
        MonitoringPrincipal {
            id: row.id,
            username: row.username,
            name: row.name,
            role: parse_role(&row.role),
        }
    }
}

fn parse_role(role: &str) -> UserRole {
    if role.eq_ignore_ascii_case("admin") {
        UserRole::Admin
    } else {
        UserRole::User
    }
}

#[derive(sqlx::FromRow)]
struct TelemetryRow {
    sensor_id: i64,
    data: Json<FieldMap>,
    ts: DateTime<Utc>,
}

impl From<TelemetryRow> for TelemetryRecord {
    fn from(row: TelemetryRow) -> Self {
        TelemetryRecord {
            device_id: row.sensor_id,
            data: row.data.0,
            timestamp: row.ts,
        }
    }
}

/// Postgres-backed identity lookups and telemetry storage.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn append_once(&self, device_id: i64, data: &FieldMap) -> Result<TelemetryRecord> {
        let timestamp: DateTime<Utc> = sqlx::query_scalar(
            "INSERT INTO telemetry (sensor_id, data) VALUES ($1, $2) RETURNING ts",
        )
        .bind(device_id)
        .bind(Json(data))
        .fetch_one(&self.pool)
        .await?;

        Ok(TelemetryRecord {
            device_id,
            data: data.clone(),
            timestamp,
        })
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn find_device(&self, id: i64) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, name, username, kind, inputs, active FROM sensors WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Device::from))
    }

    async fn find_user(&self, id: i64) -> Result<Option<MonitoringPrincipal>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, name, role FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MonitoringPrincipal::from))
    }
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn append(&self, device_id: i64, data: &FieldMap) -> Result<TelemetryRecord> {
        with_retry(|| self.append_once(device_id, data)).await
    }

    async fn query(&self, filter: &TelemetryFilter) -> Result<Vec<TelemetryRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT sensor_id, data, ts FROM telemetry");
        push_conditions(&mut builder, filter);
        builder
            .push(" ORDER BY ts DESC LIMIT ")
            .push_bind(filter.limit as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = builder
            .build_query_as::<TelemetryRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(TelemetryRecord::from).collect())
    }

    async fn count(&self, filter: &TelemetryFilter) -> Result<u64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM telemetry");
        push_conditions(&mut builder, filter);

        let total: i64 = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }
}

/// Appends the filter's device and time range as a `WHERE` clause.
fn push_conditions(builder: &mut QueryBuilder<'_, Postgres>, filter: &TelemetryFilter) {
    let mut keyword = " WHERE ";
    if let Some(device_id) = filter.device_id {
        builder.push(keyword).push("sensor_id = ").push_bind(device_id);
        keyword = " AND ";
    }
    if let Some(start) = filter.start {
        builder.push(keyword).push("ts >= ").push_bind(start);
        keyword = " AND ";
    }
    if let Some(end) = filter.end {
        builder.push(keyword).push("ts <= ").push_bind(end);
    }
}

/// Runs `op` until it succeeds, fails permanently, or has hit a transient
/// database error `MAX_APPEND_ATTEMPTS` times, which yields
/// `Error::StoreUnavailable`.
async fn with_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Database(db_err)) if is_transient_error(&db_err) => {
                if attempts >= MAX_APPEND_ATTEMPTS {
                    error!("Telemetry insert failed after {} attempts: {}", attempts, db_err);
                    return Err(Error::StoreUnavailable(format!(
                        "gave up after {} attempts: {}",
                        attempts, db_err
                    )));
                }
                // 100ms, 200ms, ...
                let wait_ms = 100 * 2_u64.pow(attempts - 1);
                warn!(
                    "Telemetry insert failed (attempt {}/{}), retrying in {}ms: {}",
                    attempts, MAX_APPEND_ATTEMPTS, wait_ms, db_err
                );
                DB_RETRIES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            Err(e) => {
                error!("Telemetry insert failed: {}", e);
                return Err(e);
            }
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
