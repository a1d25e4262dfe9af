mod telemetry;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use telemetry::FieldSpec;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "simulator", about = "Streams simulated sensor readings to the gateway")]
struct Args {
    /// WebSocket endpoint of the gateway
    #[arg(long, env = "GATEWAY_URL", default_value = "ws://localhost:8080/ws")]
    gateway_url: String,

    /// Number of simulated sensors, ignored when tokens are given
    #[arg(long, env = "SENSORS", default_value_t = 10)]
    sensors: usize,

    /// Messages per second across all sensors
    #[arg(long, env = "RATE", default_value_t = 10.0)]
    rate: f64,

    /// Reading schema as name:type pairs
    #[arg(
        long,
        env = "FIELDS",
        default_value = "temperature:float,humidity:float,online:bool"
    )]
    fields: String,

    /// Pre-issued sensor tokens, one connection each
    #[arg(long, env = "SENSOR_TOKENS", value_delimiter = ',')]
    tokens: Vec<String>,

    /// Secret used to mint development tokens
    #[arg(
        long,
        env = "JWT_SENSOR_SECRET",
        default_value = "default-sensor-secret-change-me"
    )]
    secret: String,

    /// Sensor id of the first minted token
    #[arg(long, env = "FIRST_SENSOR_ID", default_value_t = 1)]
    first_sensor_id: i64,

    /// Chance that a field is sent malformed
    #[arg(long, env = "MALFORMED_RATE", default_value_t = 0.05)]
    malformed_rate: f64,
}

#[derive(Serialize)]
struct DevClaims {
    sub: i64,
    exp: i64,
}

fn mint_token(secret: &str, sensor_id: i64) -> anyhow::Result<String> {
    let claims = DevClaims {
        sub: sensor_id,
        exp: Utc::now().timestamp() + 3600,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if !args.rate.is_finite() || args.rate <= 0.0 {
        bail!("rate must be positive");
    }
    let fields = Arc::new(telemetry::parse_fields(&args.fields)?);

    let tokens = if args.tokens.is_empty() {
        (0..args.sensors as i64)
            .map(|i| mint_token(&args.secret, args.first_sensor_id + i))
            .collect::<anyhow::Result<Vec<_>>>()?
    } else {
        args.tokens.clone()
    };
    if tokens.is_empty() {
        bail!("no sensors to simulate");
    }

    let interval =
        Duration::from_secs_f64(tokens.len() as f64 / args.rate).max(Duration::from_millis(1));
    info!("Starting sensor simulator");
    info!(
        "Gateway: {}, Sensors: {}, Rate: {} msg/s, Fields: {}",
        args.gateway_url,
        tokens.len(),
        args.rate,
        args.fields
    );

    let mut handles = Vec::with_capacity(tokens.len());
    for (index, token) in tokens.into_iter().enumerate() {
        let url = args.gateway_url.clone();
        let fields = fields.clone();
        let malformed_rate = args.malformed_rate;
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_sensor(index, &url, &token, fields, interval, malformed_rate).await {
                error!(sensor = index, "Sensor stopped: {:#}", e);
            }
        }));
    }

    tokio::select! {
        _ = futures_util::future::join_all(handles) => {
            warn!("All sensors stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

async fn run_sensor(
    index: usize,
    url: &str,
    token: &str,
    fields: Arc<Vec<FieldSpec>>,
    interval: Duration,
    malformed_rate: f64,
) -> anyhow::Result<()> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("x-auth-token", HeaderValue::from_str(token)?);
    request
        .headers_mut()
        .insert("x-auth-role", HeaderValue::from_static("sensor"));

    let (socket, _) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {}", url))?;
    let (mut sink, mut stream) = socket.split();

    let mut reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => log_server_frame(index, &text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(sensor = index, "WebSocket error: {}", e);
                    break;
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(interval);
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reading = {
                    let mut rng = rand::thread_rng();
                    telemetry::generate_reading(&mut rng, &fields, malformed_rate)
                };
                sent += 1;
                let frame = json!({"event": "sensor-data", "id": sent, "data": reading});
                sink.send(Message::Text(frame.to_string())).await?;

                if sent % 1000 == 0 {
                    info!(sensor = index, "Sent {} readings", sent);
                }
            }
            _ = &mut reader => {
                bail!("connection closed by gateway after {} readings", sent);
            }
        }
    }
}

fn log_server_frame(index: usize, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(sensor = index, "Unreadable frame from gateway: {}", e);
            return;
        }
    };
    let data = &frame["data"];

    match frame["event"].as_str() {
        Some("ack") if data["success"] == true => {
            debug!(sensor = index, id = %data["id"], "Reading stored at {}", data["timestamp"]);
        }
        Some("ack") => {
            warn!(sensor = index, id = %data["id"], "Reading rejected: {}", data["error"]);
        }
        Some("connected") => info!(sensor = index, "Authenticated as sensor {}", data["id"]),
        Some("error") => warn!(sensor = index, "Gateway error: {}", data["message"]),
        other => debug!(sensor = index, event = ?other, "Ignoring event"),
    }
}
