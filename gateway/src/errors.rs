use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection attempt was refused. Every variant is terminal for the
/// connection; the client is told and the transport is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("token and role required")]
    MalformedHandshake,

    #[error("invalid role")]
    InvalidRole,

    /// Bad signature, expired, or signed with the other role's secret.
    #[error("invalid token")]
    InvalidToken,

    #[error("unknown or inactive principal")]
    UnknownOrInactivePrincipal,

    #[error("internal error during authentication")]
    Internal,
}

impl Rejection {
    /// Message sent to the client in the `error` event. Token and principal
    /// failures are not told apart on the wire.
    pub fn client_message(&self) -> &'static str {
        match self {
            Rejection::MalformedHandshake => "token and role required",
            Rejection::InvalidRole => "invalid role",
            Rejection::InvalidToken
            | Rejection::UnknownOrInactivePrincipal
            | Rejection::Internal => "authentication failed",
        }
    }
}
