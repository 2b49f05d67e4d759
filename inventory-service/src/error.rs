use diesel_async::pooled_connection::PoolError;
use thiserror::Error;
use uuid::Uuid;

/// Faults: conditions the caller cannot fix by retrying with other input.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),

    /// `quantity_on_hand >= quantity_reserved >= 0` would have been broken.
    #[error("stock invariant violated for variant {variant_id}: {detail}")]
    InvariantViolation { variant_id: Uuid, detail: String },

    #[error("unrecognised {column} value {value:?}")]
    Corrupt { column: &'static str, value: String },

    #[error("unexpected ledger outcome: {0}")]
    Unexpected(String),
}

impl StoreError {
    /// A duplicate key on insert, e.g. registering a variant twice.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Database(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    }
}

/// Outcome of a ledger primitive that did not apply.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("variant {0} not found")]
    NotFound(Uuid),

    #[error("variant {0} is inactive")]
    Inactive(Uuid),

    #[error("insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("stock invariant violated for variant {variant_id}: {detail}")]
    InvariantViolation { variant_id: Uuid, detail: String },

    #[error("on hand {on_hand} + {delta} is out of range for variant {variant_id}")]
    OutOfRange { variant_id: Uuid, on_hand: i32, delta: i32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<diesel::result::Error> for LedgerError {
    fn from(err: diesel::result::Error) -> Self {
        LedgerError::Store(StoreError::Database(err))
    }
}

impl From<LedgerError> for StoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Store(inner) => inner,
            LedgerError::InvariantViolation { variant_id, detail } => {
                StoreError::InvariantViolation { variant_id, detail }
            }
            other => StoreError::Unexpected(other.to_string()),
        }
    }
}

/// Error returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::InvariantViolation { .. }))
    }
}
