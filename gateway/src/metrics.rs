use crate::errors::Rejection;
use crate::rooms::Room;
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CONNECTIONS_ACTIVE: GaugeVec = GaugeVec::new(
        Opts::new(
            "gateway_connections_active",
            "Authenticated connections currently in each room"
        ),
        &["room"]
    )
    .unwrap();
    pub static ref AUTH_REJECTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "gateway_auth_rejections_total",
            "Connection attempts refused, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref SENSOR_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_sensor_messages_total",
        "Total sensor-data frames received"
    ))
    .unwrap();
    pub static ref READINGS_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_readings_stored_total",
        "Total readings validated and appended to the store"
    ))
    .unwrap();
    pub static ref READING_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_reading_failures_total",
        "Total sensor-data frames answered with an error"
    ))
    .unwrap();
    pub static ref BROADCAST_DELIVERIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_broadcast_deliveries_total",
        "Total events queued to room members"
    ))
    .unwrap();
    pub static ref DB_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_db_retries_total",
        "Total transient database failures that were retried"
    ))
    .unwrap();
    pub static ref APPEND_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_append_latency_seconds",
            "Time taken to append one reading to the store"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(AUTH_REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SENSOR_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_STORED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READING_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROADCAST_DELIVERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(APPEND_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn record_rejection(rejection: &Rejection) {
    let reason = match rejection {
        Rejection::MalformedHandshake => "malformed_handshake",
        Rejection::InvalidRole => "invalid_role",
        Rejection::InvalidToken => "invalid_token",
        Rejection::UnknownOrInactivePrincipal => "unknown_or_inactive",
        Rejection::Internal => "internal",
    };
    AUTH_REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

/// Moves one connection between the per-room gauges. Either side may be
/// `None` for a connection entering or leaving the rooms altogether.
pub fn record_room_change(gauge: &GaugeVec, from: Option<Room>, to: Option<Room>) {
    if from == to {
        return;
    }
    if let Some(room) = from {
        gauge.with_label_values(&[room.name()]).dec();
    }
    if let Some(room) = to {
        gauge.with_label_values(&[room.name()]).inc();
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
