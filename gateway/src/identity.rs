use crate::errors::Result;
use crate::model::{Device, MonitoringPrincipal};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// The two kinds of principal that share the gateway socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sensor,
    Dashboard,
}

impl Role {
    /// Parses the role tag presented in the handshake.
    pub fn from_tag(tag: &str) -> Option<Role> {
        match tag {
            "sensor" => Some(Role::Sensor),
            "usuario" => Some(Role::Dashboard),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Role::Sensor => "sensor",
            Role::Dashboard => "usuario",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Read-only view of the identity database.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_device(&self, id: i64) -> Result<Option<Device>>;

    async fn find_user(&self, id: i64) -> Result<Option<MonitoringPrincipal>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Principal {
    Sensor(Device),
    Dashboard(MonitoringPrincipal),
}

/// Maps a verified token subject onto a live, eligible principal.
#[derive(Clone)]
pub struct PrincipalResolver {
    store: Arc<dyn IdentityStore>,
}

impl PrincipalResolver {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// `Ok(None)` means not found, or a sensor that has been deactivated.
    pub async fn resolve(&self, role: Role, subject_id: i64) -> Result<Option<Principal>> {
        match role {
            Role::Sensor => Ok(self
                .resolve_device(subject_id)
                .await?
                .map(Principal::Sensor)),
            Role::Dashboard => Ok(self
                .store
                .find_user(subject_id)
                .await?
                .map(Principal::Dashboard)),
        }
    }

    /// Looks up an active device. Also used to re-check a sensor mid-session.
    pub async fn resolve_device(&self, device_id: i64) -> Result<Option<Device>> {
        let device = self.store.find_device(device_id).await?;
        Ok(device.filter(|d| d.active))
    }
}
