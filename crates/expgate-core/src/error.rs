use thiserror::Error;

pub type GateResult<T> = Result<T, GateError>;

/// Request-scoped failures, classified by cause. Each variant maps to one
/// HTTP status and a short machine string; none of them are retried by the
/// gateway itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("Missing token")]
    MissingToken,

    #[error("Token not found")]
    NotFound,

    #[error("Not found")]
    AssetNotFound,

    #[error("Invalid mode")]
    InvalidMode,

    #[error("Token expired")]
    Expired,

    #[error("Grace period expired")]
    GraceExpired,

    #[error("Device not allowed")]
    DeviceNotAllowed,

    #[error("Too early")]
    TooEarly { start_at_ms: u64 },

    #[error("Token already used")]
    AlreadyUsed,

    #[error("Missing prefix")]
    MissingPrefix,

    #[error("{0} store unconfigured")]
    StoreUnconfigured(&'static str),

    #[error("store failure: {0}")]
    Store(String),

    #[error("upstream fetch failed: {0}")]
    Upstream(String),
}

impl GateError {
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::MissingToken | Self::InvalidMode | Self::MissingPrefix => 400,
            Self::NotFound | Self::AssetNotFound => 404,
            Self::DeviceNotAllowed => 403,
            Self::TooEarly { .. } | Self::AlreadyUsed => 409,
            Self::Expired | Self::GraceExpired => 410,
            Self::StoreUnconfigured(_) | Self::Store(_) => 500,
            Self::Upstream(_) => 502,
        }
    }
}
