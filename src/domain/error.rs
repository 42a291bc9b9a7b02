use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChargeError {
    /// Missing, inactive or expired credential for an establishment/provider pair.
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("validation: {0}")]
    Validation(String),

    /// The provider refused our credentials. Not retried.
    #[error("authentication: {0}")]
    Authentication(String),

    /// Timeouts, 5xx, connection failures. Safe to retry.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Explicit rejection by the provider (bad payer document, unknown charge).
    #[error("provider rejected request: {0}")]
    TerminalProvider(String),

    #[error("operation not supported by provider: {0}")]
    Unsupported(String),

    #[error("webhook signature: {0}")]
    WebhookSignature(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Broken internal invariant. Halts the operation, never repaired.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChargeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Short machine-readable kind, stored in audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Validation(_) => "validation",
            Self::Authentication(_) => "authentication",
            Self::Transient(_) => "transient",
            Self::TerminalProvider(_) => "terminal_provider",
            Self::Unsupported(_) => "unsupported",
            Self::WebhookSignature(_) => "webhook_signature",
            Self::NotFound(_) => "not_found",
            Self::Invariant(_) => "invariant",
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
        }
    }
}
