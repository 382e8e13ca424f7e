use thiserror::Error;

/// Typed failures surfaced by the ledger engine. The engine recovers none of
/// these locally — every variant propagates to the HTTP layer for mapping.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("idempotency conflict for request_id '{request_id}'")]
    IdempotencyConflict { request_id: String },

    #[error("unknown zone '{zone_id}'")]
    ZoneUnknown { zone_id: String },

    #[error("zone '{zone_id}' is down: {reason}")]
    ZoneDown { zone_id: String, reason: String },

    #[error("zone '{zone_id}' is blocked: {reason}")]
    ZoneBlocked { zone_id: String, reason: String },

    #[error("zone '{zone_id}' is not ready for replay")]
    NotReady { zone_id: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden")]
    Forbidden,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Internal(err.to_string())
    }
}

impl LedgerError {
    /// Semantic kind name used in audit/log context, independent of the
    /// Display message (which carries interpolated detail).
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::BadRequest(_) => "BadRequest",
            LedgerError::IdempotencyConflict { .. } => "IdempotencyConflict",
            LedgerError::ZoneUnknown { .. } => "ZoneUnknown",
            LedgerError::ZoneDown { .. } => "ZoneDown",
            LedgerError::ZoneBlocked { .. } => "ZoneBlocked",
            LedgerError::NotReady { .. } => "NotReady",
            LedgerError::NotFound(_) => "NotFound",
            LedgerError::Forbidden => "Forbidden",
            LedgerError::Internal(_) => "Internal",
        }
    }
}
