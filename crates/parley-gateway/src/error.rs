use thiserror::Error;
use uuid::Uuid;

use parley_db::DbError;
use parley_types::events::ErrorCode;

/// Why a credential was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,

    #[error("credential invalid")]
    Invalid,

    #[error("credential expired")]
    Expired,

    #[error("authentication timed out")]
    Timeout,
}

/// Failures at the durable store seam.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A uniqueness guarantee rejected a create; the caller should re-find.
    #[error("conflicting record already exists")]
    Conflict,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected by store: {0}")]
    Invalid(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Conflict => StoreError::Conflict,
            DbError::NotFound(what) => StoreError::NotFound(what),
            DbError::Invalid(why) => StoreError::Invalid(why),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Rejection of a single intent. Reported to the calling connection in its
/// acknowledgment; never tears down the connection by itself.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("connection is already authenticated")]
    AlreadyAuthenticated,

    #[error("not a member of room {0}")]
    NotAMember(Uuid),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("invalid request: {0}")]
    InvalidIntent(String),

    #[error("store failure: {0}")]
    Store(StoreError),

    #[error("connection is closed")]
    ConnectionClosed,
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => GatewayError::NotFound(what),
            StoreError::Invalid(why) => GatewayError::InvalidIntent(why),
            other => GatewayError::Store(other),
        }
    }
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(_) => ErrorCode::AuthFailure,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::AlreadyAuthenticated => ErrorCode::AlreadyAuthenticated,
            Self::NotAMember(_) => ErrorCode::NotAMember,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Denied(_) => ErrorCode::Denied,
            Self::InvalidIntent(_) => ErrorCode::InvalidIntent,
            Self::Store(_) => ErrorCode::StoreFailure,
            Self::ConnectionClosed => ErrorCode::ConnectionClosed,
        }
    }
}
