use thiserror::Error;

/// Remote error strings the exchange reports for conditions that clear on
/// their own. These are retried at the same cursor; everything else the
/// server reports is fatal to the current run.
const TRANSIENT_REMOTE_ERRORS: &[&str] = &[
    "EService:Busy",
    "EService:Unavailable",
    "EService:Internal error",
    "EAPI:Rate limit exceeded",
];

#[derive(Debug, Error)]
pub enum Error {
    /// Remote busy/unavailable; retried at the same cursor after a backoff.
    #[error("Transient exchange error: {0}")]
    Transient(String),

    /// Any other remote-reported error. Fatal to the current run.
    #[error("Exchange API error: {0}")]
    Exchange(String),

    /// Unresolved asset or pair identifier. Never retried.
    #[error("Naming error: {0} is not a name the exchange recognizes")]
    Naming(String),

    /// Order submission refused by the exchange.
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify the exchange's `error` array. The first entry decides the
    /// variant; the server never mixes transient and fatal codes.
    pub fn from_remote(errors: &[String]) -> Self {
        let joined = errors.join(", ");
        let transient = errors
            .first()
            .map(|e| TRANSIENT_REMOTE_ERRORS.iter().any(|t| e.starts_with(t)))
            .unwrap_or(false);
        if transient {
            Error::Transient(joined)
        } else if errors.iter().any(|e| e.starts_with("EOrder:")) {
            Error::OrderRejected(joined)
        } else {
            Error::Exchange(joined)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
