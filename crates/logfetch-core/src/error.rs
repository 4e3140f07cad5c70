use thiserror::Error;

pub type LogFetchResult<T> = Result<T, LogFetchError>;

#[derive(Debug, Error)]
pub enum LogFetchError {
    /// Endpoint unreachable, handshake refused, or listing rejected
    #[error("connection error ({endpoint}): {reason}")]
    Connection { endpoint: String, reason: String },

    /// A remote call did not complete within its time budget (retryable)
    #[error("Timeout waiting for connection to {endpoint} ({operation})")]
    Timeout { endpoint: String, operation: String },

    /// Remote-side failure on a specific path
    #[error("transfer error ({path}): {reason}")]
    Transfer { path: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LogFetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LogFetchError::Timeout { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, LogFetchError::Connection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_classified_structurally() {
        let err = LogFetchError::Timeout {
            endpoint: "main".into(),
            operation: "read".into(),
        };
        assert!(err.is_timeout());
        assert!(!err.is_connection());
        assert!(err
            .to_string()
            .starts_with("Timeout waiting for connection"));
    }

    #[test]
    fn transfer_error_is_not_retryable() {
        let err = LogFetchError::Transfer {
            path: "20240101/a.log".into(),
            reason: "permission denied".into(),
        };
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("20240101/a.log"));
    }
}
