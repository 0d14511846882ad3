//! # Broker Errors
//!
//! Error type for broker calls and the outcome classes reconciliation branches on.

use thiserror::Error;

/// How reconciliation should treat a failed broker call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorClass {
    /// 5xx, 408, 409, 422, 429, network failures and timeouts; retry with backoff
    Transient,
    /// 410; the broker no longer knows the resource
    Gone,
    /// Any other 4xx or an undecodable response; do not retry
    Terminal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker returned HTTP {status}{}", detail_suffix(.error.as_deref(), .description.as_deref()))]
    Http {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },
    #[error("broker request timed out: {0}")]
    Timeout(String),
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("failed to decode broker response: {0}")]
    Decode(String),
    #[error("broker {0} not found")]
    UnknownBroker(String),
    #[error("invalid broker configuration: {0}")]
    Config(String),
}

fn detail_suffix(error: Option<&str>, description: Option<&str>) -> String {
    match (error, description) {
        (Some(e), Some(d)) => format!(" ({e}): {d}"),
        (Some(e), None) => format!(" ({e})"),
        (None, Some(d)) => format!(": {d}"),
        (None, None) => String::new(),
    }
}

impl BrokerError {
    /// HTTP error without a broker-provided body
    #[must_use]
    pub fn http(status: u16) -> Self {
        BrokerError::Http {
            status,
            error: None,
            description: None,
        }
    }

    /// HTTP error with a description, as brokers usually return
    #[must_use]
    pub fn http_with_description(status: u16, description: &str) -> Self {
        BrokerError::Http {
            status,
            error: None,
            description: Some(description.to_string()),
        }
    }

    #[must_use]
    pub fn class(&self) -> BrokerErrorClass {
        match self {
            BrokerError::Http { status, .. } => match status {
                410 => BrokerErrorClass::Gone,
                408 | 409 | 422 | 429 => BrokerErrorClass::Transient,
                s if *s >= 500 => BrokerErrorClass::Transient,
                _ => BrokerErrorClass::Terminal,
            },
            BrokerError::Timeout(_) | BrokerError::Transport(_) | BrokerError::UnknownBroker(_) => {
                BrokerErrorClass::Transient
            }
            BrokerError::Decode(_) | BrokerError::Config(_) => BrokerErrorClass::Terminal,
        }
    }

    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.class() == BrokerErrorClass::Gone
    }

    /// Whether the broker may have acted on the request despite the failure
    ///
    /// These failures require orphan mitigation after provision or bind.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        match self {
            BrokerError::Http { status, .. } => *status >= 500 || *status == 408,
            BrokerError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Short label for metrics
    #[must_use]
    pub fn outcome_label(&self) -> &'static str {
        match self.class() {
            BrokerErrorClass::Transient => "transient",
            BrokerErrorClass::Gone => "gone",
            BrokerErrorClass::Terminal => "terminal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        let cases = vec![
            (500, BrokerErrorClass::Transient),
            (502, BrokerErrorClass::Transient),
            (503, BrokerErrorClass::Transient),
            (408, BrokerErrorClass::Transient),
            (409, BrokerErrorClass::Transient),
            (422, BrokerErrorClass::Transient),
            (429, BrokerErrorClass::Transient),
            (410, BrokerErrorClass::Gone),
            (400, BrokerErrorClass::Terminal),
            (401, BrokerErrorClass::Terminal),
            (403, BrokerErrorClass::Terminal),
            (404, BrokerErrorClass::Terminal),
        ];

        for (status, expected) in cases {
            assert_eq!(
                BrokerError::http(status).class(),
                expected,
                "HTTP {status} should be classified as {expected:?}"
            );
        }
    }

    #[test]
    fn test_transport_errors_are_transient() {
        assert_eq!(
            BrokerError::Timeout("deadline".into()).class(),
            BrokerErrorClass::Transient
        );
        assert_eq!(
            BrokerError::Transport("connection refused".into()).class(),
            BrokerErrorClass::Transient
        );
        assert_eq!(
            BrokerError::Decode("expected value".into()).class(),
            BrokerErrorClass::Terminal
        );
    }

    #[test]
    fn test_ambiguous_failures() {
        assert!(BrokerError::http(500).is_ambiguous());
        assert!(BrokerError::http(408).is_ambiguous());
        assert!(BrokerError::Timeout("deadline".into()).is_ambiguous());
        assert!(!BrokerError::http(400).is_ambiguous());
        assert!(!BrokerError::http(422).is_ambiguous());
        assert!(!BrokerError::Transport("refused".into()).is_ambiguous());
    }

    #[test]
    fn test_display_includes_broker_description() {
        let err = BrokerError::Http {
            status: 400,
            error: Some("AsyncRequired".into()),
            description: Some("needs accepts_incomplete".into()),
        };
        assert_eq!(
            err.to_string(),
            "broker returned HTTP 400 (AsyncRequired): needs accepts_incomplete"
        );
        assert_eq!(BrokerError::http(500).to_string(), "broker returned HTTP 500");
    }
}
