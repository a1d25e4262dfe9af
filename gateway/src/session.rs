//! Connection lifecycle: authenticate, join a room, route telemetry, leave.
//!
//! ```text
//! Connecting -> Authenticating -> SensorActive    -> Closed
//!                              -> DashboardActive -> Closed
//!                              -> Closed (rejected)
//! ```
//!
//! No state is entered twice. Everything here is scoped to one connection:
//! a rejected handshake closes that socket, a bad reading only earns the
//! sender an error ack.

use crate::auth::{AuthResult, Authenticator};
use crate::errors::Rejection;
use crate::metrics::{
    self, APPEND_LATENCY_SECONDS, BROADCAST_DELIVERIES_TOTAL, CONNECTIONS_ACTIVE,
    READINGS_STORED_TOTAL, READING_FAILURES_TOTAL, SENSOR_MESSAGES_TOTAL,
};
use crate::model::{Device, MonitoringPrincipal};
use crate::protocol::{
    Ack, AckOutcome, ClientEvent, ClientFrame, ConnectionHandle, Outbound, ServerEvent,
    NOT_AUTHORIZED, SENSOR_NOT_FOUND, STORE_FAILED,
};
use crate::rooms::{ConnectionId, Room, RoomRegistry};
use crate::telemetry::TelemetryStore;
use crate::validate::validate;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Credentials as presented when the socket was opened.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Explicit auth payload.
    pub auth_token: Option<String>,
    pub auth_role: Option<String>,
    /// Raw `Authorization` header value.
    pub authorization: Option<String>,
    pub query: HashMap<String, String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Handshake {
    /// Returns `(token, role)`. The token comes from the auth payload, then
    /// a bearer header, then the query string; the role from the auth
    /// payload, then the query string.
    pub fn credentials(&self) -> Option<(String, String)> {
        let token = non_empty(self.auth_token.as_deref())
            .or_else(|| self.bearer_token())
            .or_else(|| non_empty(self.query.get("token").map(String::as_str)))?;
        let role = non_empty(self.auth_role.as_deref())
            .or_else(|| non_empty(self.query.get("role").map(String::as_str)))?;
        Some((token.to_string(), role.to_string()))
    }

    fn bearer_token(&self) -> Option<&str> {
        let (scheme, token) = self.authorization.as_deref()?.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        non_empty(Some(token))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorIdentity {
    pub device_id: i64,
    pub name: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardIdentity {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    SensorActive(SensorIdentity),
    DashboardActive(DashboardIdentity),
    Closed,
}

/// Per-connection state. Owned by the connection's handler task.
pub struct ConnectionSession {
    id: ConnectionId,
    handle: ConnectionHandle,
    state: SessionState,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, handle: ConnectionHandle) -> Self {
        Self {
            id,
            handle,
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn send(&self, event: ServerEvent) {
        // The peer may already be gone; nothing to do then.
        let _ = self.handle.send(Outbound::Event(event));
    }

    fn send_close(&self) {
        let _ = self.handle.send(Outbound::Close);
    }
}

pub struct SessionManager {
    authenticator: Authenticator,
    rooms: Arc<RoomRegistry>,
    telemetry: Arc<dyn TelemetryStore>,
}

impl SessionManager {
    pub fn new(
        authenticator: Authenticator,
        rooms: Arc<RoomRegistry>,
        telemetry: Arc<dyn TelemetryStore>,
    ) -> Self {
        Self {
            authenticator,
            rooms,
            telemetry,
        }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Runs the handshake. On `Err` the client has already been sent an
    /// `error` event and a close request, and the session is `Closed`.
    pub async fn open(
        &self,
        session: &mut ConnectionSession,
        handshake: &Handshake,
    ) -> Result<(), Rejection> {
        if session.state != SessionState::Connecting {
            warn!(conn_id = %session.id, state = ?session.state, "handshake on a session that already started");
            return Err(Rejection::Internal);
        }
        session.state = SessionState::Authenticating;

        let Some((token, role)) = handshake.credentials() else {
            return self.reject(session, Rejection::MalformedHandshake);
        };
        info!(conn_id = %session.id, role = %role, "Client authenticating");

        match self.authenticator.authenticate(&token, &role).await {
            AuthResult::Sensor(device) => {
                self.activate_sensor(session, device);
                Ok(())
            }
            AuthResult::Dashboard(user) => {
                self.activate_dashboard(session, user);
                Ok(())
            }
            AuthResult::Rejected(rejection) => self.reject(session, rejection),
        }
    }

    fn reject(&self, session: &mut ConnectionSession, rejection: Rejection) -> Result<(), Rejection> {
        metrics::record_rejection(&rejection);
        warn!(conn_id = %session.id, reason = %rejection, "Connection rejected");

        session.send(ServerEvent::Error {
            message: rejection.client_message().to_string(),
        });
        session.send_close();
        session.state = SessionState::Closed;
        Err(rejection)
    }

    fn activate_sensor(&self, session: &mut ConnectionSession, device: Device) {
        session.state = SessionState::SensorActive(SensorIdentity {
            device_id: device.id,
            name: device.name.clone(),
            username: device.username.clone(),
        });
        self.join(session, Room::Sensors);

        info!(
            conn_id = %session.id,
            sensor_id = device.id,
            "Sensor connected: {}", device.name
        );

        self.broadcast(
            Room::Dashboards,
            ServerEvent::SensorConnected {
                sensor_id: device.id,
                name: device.name,
                kind: device.kind,
                timestamp: Utc::now(),
            },
        );
        self.rooms.unicast(
            session.id,
            ServerEvent::Connected {
                message: "sensor authenticated".to_string(),
                id: device.id,
            },
        );
    }

    fn activate_dashboard(&self, session: &mut ConnectionSession, user: MonitoringPrincipal) {
        session.state = SessionState::DashboardActive(DashboardIdentity {
            user_id: user.id,
            username: user.username.clone(),
        });
        self.join(session, Room::Dashboards);

        info!(
            conn_id = %session.id,
            user_id = user.id,
            role = ?user.role,
            "Dashboard connected: {} ({})", user.name, user.username
        );

        self.rooms.unicast(
            session.id,
            ServerEvent::Connected {
                message: "dashboard authenticated".to_string(),
                id: user.id,
            },
        );
    }

    /// Parses and dispatches one inbound text frame.
    pub async fn handle_text(&self, session: &ConnectionSession, text: &str) {
        match ClientFrame::parse(text) {
            Ok(frame) => self.handle_frame(session, frame).await,
            Err(e) => warn!(conn_id = %session.id, "Ignoring malformed frame: {}", e),
        }
    }

    pub async fn handle_frame(&self, session: &ConnectionSession, frame: ClientFrame) {
        let id = frame.id;
        match frame.into_event() {
            ClientEvent::SensorData(raw) => {
                let outcome = self.on_sensor_data(session, raw).await;
                session.send(ServerEvent::Ack(Ack { id, outcome }));
            }
            ClientEvent::Unknown(event) => {
                debug!(conn_id = %session.id, event = %event, "Ignoring unknown event");
            }
        }
    }

    /// Validates, stores and fans out one reading from a sensor connection.
    pub async fn on_sensor_data(
        &self,
        session: &ConnectionSession,
        raw: Map<String, Value>,
    ) -> AckOutcome {
        let sensor = match &session.state {
            SessionState::SensorActive(sensor) => sensor.clone(),
            _ => {
                warn!(conn_id = %session.id, "sensor-data from a non-sensor connection");
                READING_FAILURES_TOTAL.inc();
                return AckOutcome::failed(NOT_AUTHORIZED);
            }
        };
        SENSOR_MESSAGES_TOTAL.inc();

        // The device may have been deactivated since the handshake.
        let device = match self
            .authenticator
            .resolver()
            .resolve_device(sensor.device_id)
            .await
        {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(sensor_id = sensor.device_id, "Sensor no longer active, dropping reading");
                READING_FAILURES_TOTAL.inc();
                return AckOutcome::failed(SENSOR_NOT_FOUND);
            }
            Err(e) => {
                error!(sensor_id = sensor.device_id, "Sensor lookup failed: {}", e);
                READING_FAILURES_TOTAL.inc();
                return AckOutcome::failed(STORE_FAILED);
            }
        };

        let data = validate(&device.inputs, &raw);

        let start = Instant::now();
        let record = match self.telemetry.append(device.id, &data).await {
            Ok(record) => record,
            Err(e) => {
                error!(sensor_id = device.id, "Failed to store reading: {}", e);
                READING_FAILURES_TOTAL.inc();
                return AckOutcome::failed(STORE_FAILED);
            }
        };
        APPEND_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        READINGS_STORED_TOTAL.inc();

        debug!(sensor_id = device.id, "Reading from {}: {:?}", device.name, record.data);

        let timestamp = record.timestamp;
        self.broadcast(
            Room::Dashboards,
            ServerEvent::NewSensorData {
                sensor_id: device.id,
                name: device.name,
                kind: device.kind,
                data: record.data,
                timestamp,
            },
        );

        AckOutcome::stored(timestamp)
    }

    /// Tears the session down after the transport went away.
    pub fn close(&self, session: &mut ConnectionSession) {
        match std::mem::replace(&mut session.state, SessionState::Closed) {
            SessionState::SensorActive(sensor) => {
                self.leave(session);
                info!(
                    conn_id = %session.id,
                    sensor_id = sensor.device_id,
                    "Sensor disconnected: {} ({})", sensor.name, sensor.username
                );
                self.broadcast(
                    Room::Dashboards,
                    ServerEvent::SensorDisconnected {
                        sensor_id: sensor.device_id,
                        username: sensor.username,
                        timestamp: Utc::now(),
                    },
                );
            }
            SessionState::DashboardActive(dashboard) => {
                self.leave(session);
                info!(
                    conn_id = %session.id,
                    user_id = dashboard.user_id,
                    "Dashboard disconnected: {}", dashboard.username
                );
            }
            SessionState::Connecting | SessionState::Authenticating => {
                info!(conn_id = %session.id, "Client disconnected before authenticating");
            }
            SessionState::Closed => {}
        }
    }

    fn join(&self, session: &ConnectionSession, room: Room) {
        let previous = self.rooms.join(session.id, room, session.handle.clone());
        metrics::record_room_change(&CONNECTIONS_ACTIVE, previous, Some(room));
    }

    fn leave(&self, session: &ConnectionSession) {
        let previous = self.rooms.leave(session.id);
        metrics::record_room_change(&CONNECTIONS_ACTIVE, previous, None);
    }

    fn broadcast(&self, room: Room, event: ServerEvent) {
        let delivered = self.rooms.broadcast(room, &event);
        BROADCAST_DELIVERIES_TOTAL.inc_by(delivered as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrincipalResolver;
    use crate::memory::{
        mint_token, sample_device, sample_user, InMemoryIdentityStore, InMemoryTelemetryStore,
        DASHBOARD_SECRET, SENSOR_SECRET,
    };
    use crate::model::FieldValue;
    use crate::telemetry::TelemetryFilter;
    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        identity: Arc<InMemoryIdentityStore>,
        telemetry: Arc<InMemoryTelemetryStore>,
        rooms: Arc<RoomRegistry>,
        manager: SessionManager,
    }

    impl Harness {
        fn new() -> Self {
            let identity = Arc::new(InMemoryIdentityStore::new());
            identity.insert_device(sample_device(1));
            identity.insert_user(sample_user(10));
            identity.insert_user(sample_user(11));
            let telemetry = Arc::new(InMemoryTelemetryStore::new());
            let rooms = Arc::new(RoomRegistry::new());
            let authenticator = Authenticator::new(
                SENSOR_SECRET,
                DASHBOARD_SECRET,
                PrincipalResolver::new(identity.clone()),
            );
            let manager = SessionManager::new(authenticator, rooms.clone(), telemetry.clone());
            Self {
                identity,
                telemetry,
                rooms,
                manager,
            }
        }

        async fn connect(
            &self,
            handshake: Handshake,
        ) -> (ConnectionSession, UnboundedReceiver<Outbound>, Result<(), Rejection>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut session = ConnectionSession::new(ConnectionId::new(), tx);
            let result = self.manager.open(&mut session, &handshake).await;
            (session, rx, result)
        }

        async fn sensor(&self, id: i64) -> (ConnectionSession, UnboundedReceiver<Outbound>) {
            let (session, mut rx, result) = self.connect(auth(&mint_token(SENSOR_SECRET, id, 3600), "sensor")).await;
            result.unwrap();
            assert!(matches!(rx.try_recv().unwrap(), Outbound::Event(ServerEvent::Connected { .. })));
            (session, rx)
        }

        async fn dashboard(&self, id: i64) -> (ConnectionSession, UnboundedReceiver<Outbound>) {
            let (session, mut rx, result) = self.connect(auth(&mint_token(DASHBOARD_SECRET, id, 3600), "usuario")).await;
            result.unwrap();
            assert!(matches!(rx.try_recv().unwrap(), Outbound::Event(ServerEvent::Connected { .. })));
            (session, rx)
        }
    }

    fn auth(token: &str, role: &str) -> Handshake {
        Handshake {
            auth_token: Some(token.to_string()),
            auth_role: Some(role.to_string()),
            ..Default::default()
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_credentials_priority() {
        let mut handshake = Handshake {
            auth_token: Some("from-auth".to_string()),
            auth_role: None,
            authorization: Some("Bearer from-header".to_string()),
            query: HashMap::from([
                ("token".to_string(), "from-query".to_string()),
                ("role".to_string(), "sensor".to_string()),
            ]),
        };
        assert_eq!(
            handshake.credentials(),
            Some(("from-auth".to_string(), "sensor".to_string()))
        );

        handshake.auth_token = Some("  ".to_string());
        assert_eq!(handshake.credentials().unwrap().0, "from-header");

        handshake.authorization = Some("Basic abc".to_string());
        assert_eq!(handshake.credentials().unwrap().0, "from-query");

        handshake.query.remove("role");
        assert_eq!(handshake.credentials(), None);
    }

    #[tokio::test]
    async fn test_sensor_lifecycle_is_announced_once_each() {
        let h = Harness::new();
        let (_dash, mut dash_rx) = h.dashboard(10).await;

        let (mut sensor, mut sensor_rx) = h.sensor(1).await;
        assert_eq!(h.rooms.member_count(Room::Sensors), 1);
        assert!(drain(&mut sensor_rx).is_empty());

        h.manager.close(&mut sensor);
        assert_eq!(sensor.state(), &SessionState::Closed);
        assert_eq!(h.rooms.member_count(Room::Sensors), 0);

        let events = drain(&mut dash_rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            Outbound::Event(ServerEvent::SensorConnected { sensor_id: 1, name, kind, .. })
                if name == "Sensor 1" && kind == "thermo"
        ));
        assert!(matches!(
            &events[1],
            Outbound::Event(ServerEvent::SensorDisconnected { sensor_id: 1, username, .. })
                if username == "sensor-1"
        ));
    }

    #[tokio::test]
    async fn test_dashboard_join_is_not_announced() {
        let h = Harness::new();
        let (_first, mut first_rx) = h.dashboard(10).await;
        let (mut second, _second_rx) = h.dashboard(11).await;

        assert_eq!(h.rooms.member_count(Room::Dashboards), 2);
        h.manager.close(&mut second);
        assert_eq!(h.rooms.member_count(Room::Dashboards), 1);
        assert!(drain(&mut first_rx).is_empty());
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected_and_closed() {
        let h = Harness::new();
        let handshake = Handshake {
            auth_token: Some(mint_token(SENSOR_SECRET, 1, 3600)),
            ..Default::default()
        };

        let (session, mut rx, result) = h.connect(handshake).await;

        assert_eq!(result, Err(Rejection::MalformedHandshake));
        assert_eq!(session.state(), &SessionState::Closed);
        assert_eq!(
            drain(&mut rx),
            vec![
                Outbound::Event(ServerEvent::Error {
                    message: "token and role required".to_string()
                }),
                Outbound::Close,
            ]
        );
        assert_eq!(h.rooms.member_count(Room::Sensors), 0);
    }

    #[tokio::test]
    async fn test_rejections_leave_no_membership() {
        let h = Harness::new();
        let sensor_token = mint_token(SENSOR_SECRET, 1, 3600);

        let cases = [
            (auth(&sensor_token, "robot"), Rejection::InvalidRole, "invalid role"),
            (auth(&sensor_token, "usuario"), Rejection::InvalidToken, "authentication failed"),
            (
                auth(&mint_token(SENSOR_SECRET, 404, 3600), "sensor"),
                Rejection::UnknownOrInactivePrincipal,
                "authentication failed",
            ),
        ];

        for (handshake, expected, message) in cases {
            let (_session, mut rx, result) = h.connect(handshake).await;
            assert_eq!(result, Err(expected));
            assert_eq!(
                drain(&mut rx).first(),
                Some(&Outbound::Event(ServerEvent::Error {
                    message: message.to_string()
                }))
            );
        }

        assert_eq!(h.rooms.member_count(Room::Sensors), 0);
        assert_eq!(h.rooms.member_count(Room::Dashboards), 0);
    }

    #[tokio::test]
    async fn test_no_state_is_reentered() {
        let h = Harness::new();
        let (mut session, _rx) = h.sensor(1).await;
        let handshake = auth(&mint_token(SENSOR_SECRET, 1, 3600), "sensor");

        assert_eq!(h.manager.open(&mut session, &handshake).await, Err(Rejection::Internal));
        assert!(matches!(session.state(), SessionState::SensorActive(_)));

        h.manager.close(&mut session);
        h.manager.close(&mut session);
        assert_eq!(session.state(), &SessionState::Closed);
    }

    #[tokio::test]
    async fn test_sensor_data_is_validated_stored_and_broadcast() {
        let h = Harness::new();
        let (_dash, mut dash_rx) = h.dashboard(10).await;
        let (sensor, _sensor_rx) = h.sensor(1).await;
        drain(&mut dash_rx);

        let outcome = h
            .manager
            .on_sensor_data(&sensor, payload(json!({"temp": "21.5", "ok": "1", "extra": "x"})))
            .await;

        let stored = h.telemetry.query(&TelemetryFilter::new(None, None)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(outcome, AckOutcome::stored(stored[0].timestamp));
        assert_eq!(stored[0].data["temp"], FieldValue::Float(21.5));
        assert_eq!(stored[0].data["ok"], FieldValue::Bool(true));
        assert!(!stored[0].data.contains_key("extra"));

        let events = drain(&mut dash_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Outbound::Event(ServerEvent::NewSensorData {
                sensor_id,
                data,
                timestamp,
                ..
            }) => {
                assert_eq!(*sensor_id, 1);
                assert_eq!(data, &stored[0].data);
                assert_eq!(*timestamp, stored[0].timestamp);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_reading_still_appended() {
        let h = Harness::new();
        let (sensor, _rx) = h.sensor(1).await;

        let outcome = h
            .manager
            .on_sensor_data(&sensor, payload(json!({"temp": "abc", "ok": "maybe"})))
            .await;

        assert!(matches!(outcome, AckOutcome::Stored { success: true, .. }));
        let stored = h.telemetry.query(&TelemetryFilter::new(None, None)).await.unwrap();
        assert_eq!(stored[0].data["temp"], FieldValue::Null);
        assert_eq!(stored[0].data["ok"], FieldValue::Null);
    }

    #[tokio::test]
    async fn test_dashboard_cannot_send_telemetry() {
        let h = Harness::new();
        let (dash, mut dash_rx) = h.dashboard(10).await;
        let (_other, mut other_rx) = h.dashboard(11).await;

        h.manager
            .handle_text(&dash, r#"{"event":"sensor-data","id":1,"data":{"temp":1}}"#)
            .await;

        assert_eq!(
            drain(&mut dash_rx),
            vec![Outbound::Event(ServerEvent::Ack(Ack {
                id: Some(1),
                outcome: AckOutcome::failed("not authorized"),
            }))]
        );
        assert!(drain(&mut other_rx).is_empty());
        assert_eq!(h.telemetry.count(&TelemetryFilter::for_device(1)).await.unwrap(), 0);
        assert!(matches!(dash.state(), SessionState::DashboardActive(_)));
    }

    #[tokio::test]
    async fn test_deactivated_sensor_gets_local_error() {
        let h = Harness::new();
        let (_dash, mut dash_rx) = h.dashboard(10).await;
        let (sensor, _rx) = h.sensor(1).await;
        drain(&mut dash_rx);

        let mut device = sample_device(1);
        device.active = false;
        h.identity.insert_device(device);

        let outcome = h.manager.on_sensor_data(&sensor, payload(json!({"temp": 1}))).await;

        assert_eq!(outcome, AckOutcome::failed(SENSOR_NOT_FOUND));
        assert!(drain(&mut dash_rx).is_empty());
        assert!(matches!(sensor.state(), SessionState::SensorActive(_)));
    }

    #[tokio::test]
    async fn test_store_failure_gets_local_error() {
        let h = Harness::new();
        let (_dash, mut dash_rx) = h.dashboard(10).await;
        let (sensor, _rx) = h.sensor(1).await;
        drain(&mut dash_rx);
        h.telemetry.fail_appends(true);

        let outcome = h.manager.on_sensor_data(&sensor, payload(json!({"temp": 1}))).await;

        assert_eq!(outcome, AckOutcome::failed(STORE_FAILED));
        assert!(drain(&mut dash_rx).is_empty());

        h.telemetry.fail_appends(false);
        let outcome = h.manager.on_sensor_data(&sensor, payload(json!({"temp": 2}))).await;
        assert!(matches!(outcome, AckOutcome::Stored { .. }));
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_frames_are_ignored() {
        let h = Harness::new();
        let (sensor, mut rx) = h.sensor(1).await;

        h.manager.handle_text(&sensor, "{{{").await;
        h.manager.handle_text(&sensor, r#"{"event":"ping","id":4}"#).await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(h.telemetry.count(&TelemetryFilter::for_device(1)).await.unwrap(), 0);
    }
}
