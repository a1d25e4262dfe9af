//! Token verification and principal lookup for new connections.
//!
//! Sensors and dashboards sign with different secrets, so a token is only
//! ever checked against the key of the role it claims.

use crate::errors::{Rejection, Result};
use crate::identity::{Principal, PrincipalResolver, Role};
use crate::model::{Device, MonitoringPrincipal};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Deserializer};
use tracing::{debug, error};

/// Claims the gateway reads from an issued token. `exp` is required and
/// checked by the validator; anything else is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(deserialize_with = "subject_id")]
    pub sub: i64,
}

/// Issuers put the numeric id in `sub` either as a number or a string.
fn subject_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Subject {
        Id(i64),
        Text(String),
    }

    match Subject::deserialize(deserializer)? {
        Subject::Id(id) => Ok(id),
        Subject::Text(text) => text.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    Sensor(Device),
    Dashboard(MonitoringPrincipal),
    Rejected(Rejection),
}

pub struct Authenticator {
    sensor_key: DecodingKey,
    dashboard_key: DecodingKey,
    validation: Validation,
    resolver: PrincipalResolver,
}

impl Authenticator {
    pub fn new(sensor_secret: &str, dashboard_secret: &str, resolver: PrincipalResolver) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // No clock tolerance: a token is dead the second it expires.
        validation.leeway = 0;

        Self {
            sensor_key: DecodingKey::from_secret(sensor_secret.as_bytes()),
            dashboard_key: DecodingKey::from_secret(dashboard_secret.as_bytes()),
            validation,
            resolver,
        }
    }

    pub fn resolver(&self) -> &PrincipalResolver {
        &self.resolver
    }

    /// Checks signature and expiry against the secret for `role`.
    pub fn verify(&self, token: &str, role: Role) -> Result<Claims> {
        let key = match role {
            Role::Sensor => &self.sensor_key,
            Role::Dashboard => &self.dashboard_key,
        };
        let data = decode::<Claims>(token, key, &self.validation)?;
        Ok(data.claims)
    }

    /// Authenticates a handshake whose role is still an unparsed tag.
    pub async fn authenticate(&self, token: &str, claimed_role: &str) -> AuthResult {
        match Role::from_tag(claimed_role) {
            Some(role) => self.authenticate_as(token, role).await,
            None => AuthResult::Rejected(Rejection::InvalidRole),
        }
    }

    pub async fn authenticate_as(&self, token: &str, role: Role) -> AuthResult {
        // Expired and tampered tokens collapse into one outcome.
        let claims = match self.verify(token, role) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(%role, "token rejected: {}", e);
                return AuthResult::Rejected(Rejection::InvalidToken);
            }
        };

        match self.resolver.resolve(role, claims.sub).await {
            Ok(Some(Principal::Sensor(device))) => AuthResult::Sensor(device),
            Ok(Some(Principal::Dashboard(user))) => AuthResult::Dashboard(user),
            Ok(None) => AuthResult::Rejected(Rejection::UnknownOrInactivePrincipal),
            Err(e) => {
                error!(%role, subject = claims.sub, "identity lookup failed: {}", e);
                AuthResult::Rejected(Rejection::Internal)
            }
        }
    }
}
