use thiserror::Error;

/// Every error that crosses a component boundary.
///
/// The set is closed: callers match on the kind to decide retry, reject or
/// escalate. Only `Integrity` is fatal to the component that raises it; the
/// runtime stops the component and notifies its parent.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed exchange payload: {0}")]
    Protocol(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("credentials rejected: {0}")]
    Auth(String),

    /// Pre-trade validation rejection. The message is the user-facing reason
    /// and is surfaced verbatim through the strategy log.
    #[error("{0}")]
    Validation(String),

    #[error("exchange rejected order: {0}")]
    ExchangeReject(String),

    #[error("request to {target} timed out after {waited_ms}ms")]
    Timeout { target: String, waited_ms: u64 },

    #[error("script error in {strategy}: {message}")]
    Script { strategy: String, message: String },

    #[error("persistence integrity violation: {0}")]
    Integrity(String),
}

impl CoreError {
    /// Fatal errors stop the component; everything else aborts only the
    /// current message handler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Integrity(_))
    }

    pub fn timeout(target: impl Into<String>, waited_ms: u64) -> Self {
        CoreError::Timeout {
            target: target.into(),
            waited_ms,
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Network(err.to_string())
    }
}

impl From<reqwest_middleware::Error> for CoreError {
    fn from(err: reqwest_middleware::Error) -> Self {
        CoreError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Protocol(err.to_string())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Integrity(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_is_verbatim() {
        let err = CoreError::Validation(
            "Order value 50000.00 exceeds max position size limit 10000.00".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "Order value 50000.00 exceeds max position size limit 10000.00"
        );
    }

    #[test]
    fn only_integrity_is_fatal() {
        assert!(CoreError::Integrity("dup".into()).is_fatal());
        assert!(!CoreError::Network("reset".into()).is_fatal());
        assert!(!CoreError::timeout("risk-gate", 5000).is_fatal());
    }
}
