use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Coarse classification of a [`LedgerError`], used by callers to decide
/// whether to retry, surface, or alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    InsufficientBalance,
    ExternalUnavailable,
    InvariantViolation,
    Internal,
}

impl ErrorKind {
    /// Stable code handed to callers for programmatic handling.
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "LEDGER_VALIDATION",
            Self::NotFound => "LEDGER_NOT_FOUND",
            Self::Conflict => "LEDGER_CONFLICT",
            Self::InsufficientBalance => "LEDGER_INSUFFICIENT_BALANCE",
            Self::ExternalUnavailable => "LEDGER_EXTERNAL_UNAVAILABLE",
            Self::InvariantViolation => "LEDGER_INVARIANT_VIOLATION",
            Self::Internal => "LEDGER_INTERNAL",
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Conflict | Self::ExternalUnavailable)
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Decimal, reason: String },
    #[error("Amount {amount} outside allowed range [{min}, {max}]")]
    AmountOutOfRange {
        amount: Decimal,
        min: Decimal,
        max: Decimal,
    },
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An active payment already exists for order {0}")]
    DuplicatePayment(String),
    #[error("Cycle detected: {parent} is already below {child}")]
    CycleDetected { parent: String, child: String },
    #[error("Commission entry {0} has already been reversed")]
    AlreadyReversed(String),
    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },
    #[error("External service unavailable: {0}")]
    ExternalUnavailable(String),
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_)
            | Self::InvalidAmount { .. }
            | Self::AmountOutOfRange { .. }
            | Self::InvalidTransition { .. }
            | Self::CycleDetected { .. }
            | Self::AlreadyReversed(_)
            | Self::ConfigError(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) | Self::DuplicatePayment(_) => ErrorKind::Conflict,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::ExternalUnavailable(_) => ErrorKind::ExternalUnavailable,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::CsvError(_) | Self::IoError(_) | Self::SerdeError(_) | Self::InternalError(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Message safe to show to an end user. Never includes internal detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. } | Self::AmountOutOfRange { .. } => {
                "The amount is outside the allowed limits."
            }
            Self::InsufficientBalance { .. } => "Insufficient available commission balance.",
            Self::DuplicatePayment(_) => "A payment for this order is already in progress.",
            Self::CycleDetected { .. } => "The agent cannot be placed under its own downline.",
            Self::AlreadyReversed(_) => "This commission has already been reversed.",
            Self::InvalidTransition { .. } => "The request is not allowed in the current state.",
            Self::NotFound { .. } => "The requested record does not exist.",
            _ => match self.kind() {
                ErrorKind::Validation => "The request is invalid.",
                ErrorKind::Conflict => "The record was modified concurrently, please retry.",
                ErrorKind::ExternalUnavailable => {
                    "The settlement network is temporarily unavailable, please retry."
                }
                _ => "An internal error occurred.",
            },
        }
    }
}

/// Failure reported by an external collaborator (settlement network or
/// exchange-rate source).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// Timeouts, connection resets, rate limiting. Safe to retry.
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ExternalError> for LedgerError {
    fn from(err: ExternalError) -> Self {
        LedgerError::ExternalUnavailable(err.to_string())
    }
}
