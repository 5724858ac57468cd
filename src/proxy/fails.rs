//! Retriable-failure classification
//!
//! An ordered chain of predicates over dispatch errors; the first match
//! wins. The chain is data-driven so deployments can reorder or drop
//! rules without touching the round tripper.

use crate::proxy::transport::DispatchError;

/// Terminal classification of a dispatch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// TCP connect timed out
    DialTimeout,
    /// TCP connect failed, or the connection died before the request was
    /// written
    DialFailed,
    /// TLS handshake failed or timed out
    TlsHandshakeFailed,
    /// The remote presented a certificate for the wrong name, or the
    /// configured name is unusable; suggests a stale route
    HostnameInvalid,
    /// Response headers did not arrive in time
    ResponseHeaderTimeout,
    /// The client went away
    Canceled,
    /// Every eligible endpoint was tried
    AttemptsExhausted,
    /// The pool had no eligible endpoint to try
    NoEndpoints,
    /// The route service hop failed
    RouteServiceFailed,
    /// Anything else; never retried
    Other,
}

impl FailureClass {
    /// Whether another endpoint may be attempted after this failure.
    /// Only errors raised before the request body was consumed qualify.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::DialTimeout | Self::DialFailed | Self::TlsHandshakeFailed | Self::HostnameInvalid
        )
    }

    /// Stable name used in attempt records and logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DialTimeout => "dial_timeout",
            Self::DialFailed => "dial_failed",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::HostnameInvalid => "hostname_invalid",
            Self::ResponseHeaderTimeout => "response_header_timeout",
            Self::Canceled => "canceled",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::NoEndpoints => "no_endpoints",
            Self::RouteServiceFailed => "route_service_failed",
            Self::Other => "other",
        }
    }
}

/// One classification rule
pub struct Classifier {
    /// Rule name, for tracing which rule matched
    pub name: &'static str,
    matches: fn(&DispatchError) -> Option<FailureClass>,
}

impl Classifier {
    pub fn new(name: &'static str, matches: fn(&DispatchError) -> Option<FailureClass>) -> Self {
        Self { name, matches }
    }
}

/// Ordered first-match-wins rule chain
pub struct ClassifierChain {
    classifiers: Vec<Classifier>,
}

impl ClassifierChain {
    pub fn new(classifiers: Vec<Classifier>) -> Self {
        Self { classifiers }
    }

    /// The default rule set, in match order
    pub fn default_chain() -> Self {
        Self::new(vec![
            Classifier::new("canceled", |err| {
                matches!(err, DispatchError::Canceled).then_some(FailureClass::Canceled)
            }),
            Classifier::new("dial-timeout", |err| {
                matches!(err, DispatchError::DialTimeout { .. })
                    .then_some(FailureClass::DialTimeout)
            }),
            Classifier::new("dial-failed", |err| {
                matches!(err, DispatchError::DialFailed { .. }).then_some(FailureClass::DialFailed)
            }),
            Classifier::new("hostname-invalid", |err| {
                matches!(err, DispatchError::HostnameInvalid { .. })
                    .then_some(FailureClass::HostnameInvalid)
            }),
            Classifier::new("tls-handshake", |err| {
                matches!(
                    err,
                    DispatchError::TlsHandshakeFailed { .. }
                        | DispatchError::TlsHandshakeTimeout { .. }
                )
                .then_some(FailureClass::TlsHandshakeFailed)
            }),
            Classifier::new("response-header-timeout", |err| {
                matches!(err, DispatchError::ResponseHeaderTimeout { .. })
                    .then_some(FailureClass::ResponseHeaderTimeout)
            }),
            Classifier::new("connection-broke-early", |err| {
                // a pooled connection that died between checkout and use
                // behaves like a failed dial
                match err {
                    DispatchError::RequestFailed { source, .. }
                        if source.is_canceled() || source.is_incomplete_message() =>
                    {
                        Some(FailureClass::DialFailed)
                    }
                    _ => None,
                }
            }),
        ])
    }

    /// Classify an error; unmatched errors fall through to `Other`
    pub fn classify(&self, err: &DispatchError) -> FailureClass {
        for classifier in &self.classifiers {
            if let Some(class) = (classifier.matches)(err) {
                tracing::debug!(rule = classifier.name, class = class.as_str(), "classified dispatch error");
                return class;
            }
        }
        FailureClass::Other
    }
}

impl Default for ClassifierChain {
    fn default() -> Self {
        Self::default_chain()
    }
}
