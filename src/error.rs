use thiserror::Error;

/// A failure raised by one step of an application attempt.
///
/// The classification decides what the attempt state machine does next:
/// `Network` and `Timeout` are retryable with backoff, `ElementNotFound`
/// gets one retry with the alternate detection strategy, everything else
/// is fatal to the attempt (but never to the session).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("required field left unfilled: {0}")]
    FieldUnfilled(String),

    #[error("submission could not be verified")]
    Unverified,

    #[error("attempt cancelled")]
    Cancelled,

    #[error("site not supported: {0}")]
    UnsupportedSite(String),

    #[error("browser engine failure: {0}")]
    Engine(String),
}

/// Coarse error categories recorded with every `ErrorRecord` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Timeout,
    ElementNotFound,
    Validation,
    Unverified,
    Cancelled,
    UnsupportedSite,
    Engine,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ElementNotFound => "element_not_found",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unverified => "unverified",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::UnsupportedSite => "unsupported_site",
            ErrorCategory::Engine => "engine",
        }
    }
}

impl StepError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StepError::Network(_) => ErrorCategory::Network,
            StepError::Timeout(_) => ErrorCategory::Timeout,
            StepError::ElementNotFound(_) => ErrorCategory::ElementNotFound,
            StepError::FieldUnfilled(_) => ErrorCategory::Validation,
            StepError::Unverified => ErrorCategory::Unverified,
            StepError::Cancelled => ErrorCategory::Cancelled,
            StepError::UnsupportedSite(_) => ErrorCategory::UnsupportedSite,
            StepError::Engine(_) => ErrorCategory::Engine,
        }
    }

    /// Whether the state machine may retry this step with backoff.
    /// `ElementNotFound` is handled separately (one alternate-strategy retry).
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Network(_) | StepError::Timeout(_))
    }

    /// Engine failures end the whole session, not just the attempt.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, StepError::Engine(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StepError::Network("reset".into()).is_retryable());
        assert!(StepError::Timeout("navigate".into()).is_retryable());
        assert!(!StepError::ElementNotFound("form".into()).is_retryable());
        assert!(!StepError::Unverified.is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }

    #[test]
    fn engine_errors_are_session_fatal() {
        assert!(StepError::Engine("webdriver gone".into()).is_fatal_to_session());
        assert!(!StepError::Network("reset".into()).is_fatal_to_session());
    }

    #[test]
    fn category_strings() {
        assert_eq!(
            StepError::FieldUnfilled("email".into()).category().as_str(),
            "validation"
        );
        assert_eq!(StepError::Unverified.category().as_str(), "unverified");
    }
}
