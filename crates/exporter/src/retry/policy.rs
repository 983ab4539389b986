//! [`RetryPolicy`]: retry parameters derived from a gRPC service config.
//!
//! The document format is the `methodConfig` / `retryPolicy` JSON from the
//! gRPC retry design (A6). Keys are accepted in camelCase and PascalCase.

use std::{collections::HashSet, time::Duration};

use common::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Hard protocol ceiling on attempts per call, including the first.
pub const MAX_ATTEMPTS_CEILING: u32 = 5;

/// Errors that make a service config unusable for retries.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("service config is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid duration {0:?}: expected decimal seconds with an 's' suffix")]
    InvalidDuration(String),

    #[error("unknown status code {0:?}")]
    UnknownCode(String),

    #[error("invalid retry policy: {0}")]
    Invalid(&'static str),
}

/// Bounded retry parameters for export calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
    retryable_codes: HashSet<StatusCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS_CEILING,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            retryable_codes: HashSet::from([
                StatusCode::Unavailable,
                StatusCode::Cancelled,
                StatusCode::DeadlineExceeded,
                StatusCode::ResourceExhausted,
                StatusCode::Aborted,
                StatusCode::OutOfRange,
                StatusCode::DataLoss,
            ]),
        }
    }
}

impl RetryPolicy {
    /// Build a policy from explicit parameters.
    ///
    /// `max_attempts` above [`MAX_ATTEMPTS_CEILING`] is clamped.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] if `max_attempts < 2`, either backoff is
    /// zero, the multiplier is not positive, or no code is retryable.
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        retryable_codes: impl IntoIterator<Item = StatusCode>,
    ) -> Result<Self, PolicyError> {
        if max_attempts < 2 {
            return Err(PolicyError::Invalid("maxAttempts must be at least 2"));
        }
        if initial_backoff.is_zero() || max_backoff.is_zero() {
            return Err(PolicyError::Invalid("backoffs must be greater than zero"));
        }
        if !(backoff_multiplier.is_finite() && backoff_multiplier > 0.0) {
            return Err(PolicyError::Invalid("backoffMultiplier must be greater than zero"));
        }
        let retryable_codes: HashSet<StatusCode> = retryable_codes.into_iter().collect();
        if retryable_codes.is_empty() {
            return Err(PolicyError::Invalid("retryableStatusCodes must not be empty"));
        }
        if max_attempts > MAX_ATTEMPTS_CEILING {
            debug!(
                configured = max_attempts,
                effective = MAX_ATTEMPTS_CEILING,
                "clamping maxAttempts"
            );
        }
        Ok(Self {
            max_attempts: max_attempts.min(MAX_ATTEMPTS_CEILING),
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            retryable_codes,
        })
    }

    /// Derive the policy for `service` from a service config document.
    ///
    /// Falls back to [`RetryPolicy::default`] when the document is empty,
    /// unusable, or has no retry policy for the service.
    pub fn from_service_config(doc: &str, service: &str) -> Self {
        if doc.trim().is_empty() {
            return Self::default();
        }
        match Self::try_from_service_config(doc, service) {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                debug!(service, "no retry policy for service; using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(service, error = %e, "ignoring unusable service config; using default retry policy");
                Self::default()
            }
        }
    }

    /// Strict variant of [`RetryPolicy::from_service_config`].
    ///
    /// Returns `Ok(None)` when no method config with a retry policy selects
    /// the service's `Export` method.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] if the document or the selected policy is invalid.
    pub fn try_from_service_config(doc: &str, service: &str) -> Result<Option<Self>, PolicyError> {
        let parsed: ServiceConfigDoc = serde_json::from_str(doc)?;
        let Some(raw) = parsed
            .method_config
            .into_iter()
            .filter(|mc| mc.selects(service))
            .find_map(|mc| mc.retry_policy)
        else {
            return Ok(None);
        };

        let codes = raw
            .retryable_status_codes
            .iter()
            .map(CodeRepr::resolve)
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(
            raw.max_attempts,
            parse_duration(&raw.initial_backoff)?,
            parse_duration(&raw.max_backoff)?,
            raw.backoff_multiplier,
            codes,
        )
        .map(Some)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn is_retryable(&self, code: StatusCode) -> bool {
        self.retryable_codes.contains(&code)
    }

    /// Wait before the attempt following `attempt` (1-based):
    /// `min(initial × multiplier^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_backoff.as_nanos() as f64;
        if !scaled.is_finite() || scaled >= cap {
            return self.max_backoff;
        }
        Duration::from_nanos(scaled.round() as u64)
    }

    /// Decide what follows a failed `attempt`: `Some(backoff)` to retry,
    /// `None` when the failure is terminal.
    pub fn next_backoff(&self, attempt: u32, code: StatusCode) -> Option<Duration> {
        (self.is_retryable(code) && attempt < self.max_attempts).then(|| self.backoff(attempt))
    }
}

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceConfigDoc {
    #[serde(default, alias = "MethodConfig")]
    method_config: Vec<MethodConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodConfig {
    #[serde(default, alias = "Name")]
    name: Vec<MethodName>,
    #[serde(default, alias = "RetryPolicy")]
    retry_policy: Option<RawRetryPolicy>,
}

impl MethodConfig {
    fn selects(&self, service: &str) -> bool {
        self.name.iter().any(|n| {
            n.service.as_deref().map_or(true, |s| s == service)
                && n.method.as_deref().map_or(true, |m| m == "Export")
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodName {
    #[serde(default, alias = "Service")]
    service: Option<String>,
    #[serde(default, alias = "Method")]
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryPolicy {
    #[serde(alias = "MaxAttempts")]
    max_attempts: u32,
    #[serde(alias = "InitialBackoff")]
    initial_backoff: String,
    #[serde(alias = "MaxBackoff")]
    max_backoff: String,
    #[serde(alias = "BackoffMultiplier")]
    backoff_multiplier: f64,
    #[serde(alias = "RetryableStatusCodes")]
    retryable_status_codes: Vec<CodeRepr>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CodeRepr {
    Name(String),
    Number(i32),
}

impl CodeRepr {
    fn resolve(&self) -> Result<StatusCode, PolicyError> {
        match self {
            CodeRepr::Name(name) => {
                StatusCode::from_name(name).ok_or_else(|| PolicyError::UnknownCode(name.clone()))
            }
            CodeRepr::Number(n) => {
                StatusCode::from_i32(*n).ok_or_else(|| PolicyError::UnknownCode(n.to_string()))
            }
        }
    }
}

/// Parse a protobuf-JSON duration such as `"0.3s"` or `"5s"` exactly.
fn parse_duration(text: &str) -> Result<Duration, PolicyError> {
    let invalid = || PolicyError::InvalidDuration(text.to_owned());
    let digits = text.trim().strip_suffix('s').ok_or_else(invalid)?;
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let secs: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<9}").parse().map_err(|_| invalid())?
    };
    Ok(Duration::new(secs, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SERVICE_CONFIG;

    const TRACES: &str = "opentelemetry.proto.collector.trace.v1.TraceService";
    const METRICS: &str = "opentelemetry.proto.collector.metrics.v1.MetricsService";

    fn doc_with(max_attempts: u32, codes: &str) -> String {
        format!(
            r#"{{"methodConfig":[{{"name":[{{"service":"{TRACES}"}}],
                "retryPolicy":{{"maxAttempts":{max_attempts},"initialBackoff":"0.1s",
                "maxBackoff":"1s","backoffMultiplier":1.5,"retryableStatusCodes":{codes}}}}}]}}"#
        )
    }

    #[test]
    fn default_literals() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts(), 5);
        assert_eq!(p.initial_backoff(), Duration::from_millis(300));
        assert_eq!(p.max_backoff(), Duration::from_secs(5));
        assert_eq!(p.backoff_multiplier(), 2.0);
        for code in [
            StatusCode::Unavailable,
            StatusCode::Cancelled,
            StatusCode::DeadlineExceeded,
            StatusCode::ResourceExhausted,
            StatusCode::Aborted,
            StatusCode::OutOfRange,
            StatusCode::DataLoss,
        ] {
            assert!(p.is_retryable(code), "{code} should be retryable");
        }
        assert!(!p.is_retryable(StatusCode::InvalidArgument));
        assert!(!p.is_retryable(StatusCode::Unauthenticated));
    }

    #[test]
    fn builtin_document_matches_defaults_for_both_services() {
        for service in [TRACES, METRICS] {
            let p = RetryPolicy::try_from_service_config(DEFAULT_SERVICE_CONFIG, service)
                .unwrap()
                .unwrap();
            assert_eq!(p, RetryPolicy::default());
        }
    }

    #[test]
    fn max_attempts_is_clamped_to_five() {
        let p = RetryPolicy::try_from_service_config(&doc_with(10, r#"["UNAVAILABLE"]"#), TRACES)
            .unwrap()
            .unwrap();
        assert_eq!(p.max_attempts(), 5);

        let direct = RetryPolicy::new(
            10,
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
            [StatusCode::Unavailable],
        )
        .unwrap();
        assert_eq!(direct.max_attempts(), 5);
    }

    #[test]
    fn backoff_schedule_is_exact_and_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_millis(300));
        assert_eq!(p.backoff(2), Duration::from_millis(600));
        assert_eq!(p.backoff(3), Duration::from_millis(1200));
        assert_eq!(p.backoff(4), Duration::from_millis(2400));
        assert_eq!(p.backoff(5), Duration::from_millis(4800));
        assert_eq!(p.backoff(6), Duration::from_secs(5));
        assert_eq!(p.backoff(60), Duration::from_secs(5));
    }

    #[test]
    fn next_backoff_stops_at_max_attempts() {
        let p = RetryPolicy::default();
        assert_eq!(
            p.next_backoff(4, StatusCode::Unavailable),
            Some(Duration::from_millis(2400))
        );
        assert_eq!(p.next_backoff(5, StatusCode::Unavailable), None);
    }

    #[test]
    fn non_retryable_code_is_terminal_on_first_attempt() {
        let p = RetryPolicy::default();
        assert_eq!(p.next_backoff(1, StatusCode::InvalidArgument), None);
    }

    #[test]
    fn numeric_codes_and_duplicates() {
        let p = RetryPolicy::try_from_service_config(&doc_with(3, "[14, \"UNAVAILABLE\", 8]"), TRACES)
            .unwrap()
            .unwrap();
        assert!(p.is_retryable(StatusCode::Unavailable));
        assert!(p.is_retryable(StatusCode::ResourceExhausted));
        assert!(!p.is_retryable(StatusCode::Aborted));
    }

    #[test]
    fn other_service_gets_no_policy() {
        let doc = doc_with(3, r#"["UNAVAILABLE"]"#);
        assert!(RetryPolicy::try_from_service_config(&doc, METRICS).unwrap().is_none());
        assert_eq!(RetryPolicy::from_service_config(&doc, METRICS), RetryPolicy::default());
    }

    #[test]
    fn selector_without_service_matches_everything() {
        let doc = r#"{"methodConfig":[{"name":[{}],"retryPolicy":{"maxAttempts":2,
            "initialBackoff":"1s","maxBackoff":"2s","backoffMultiplier":3,
            "retryableStatusCodes":["ABORTED"]}}]}"#;
        let p = RetryPolicy::try_from_service_config(doc, METRICS).unwrap().unwrap();
        assert_eq!(p.max_attempts(), 2);
        assert_eq!(p.backoff_multiplier(), 3.0);
    }

    #[test]
    fn selector_for_other_method_does_not_match() {
        let doc = format!(
            r#"{{"methodConfig":[{{"name":[{{"service":"{TRACES}","method":"Other"}}],
                "retryPolicy":{{"maxAttempts":2,"initialBackoff":"1s","maxBackoff":"2s",
                "backoffMultiplier":3,"retryableStatusCodes":["ABORTED"]}}}}]}}"#
        );
        assert!(RetryPolicy::try_from_service_config(&doc, TRACES).unwrap().is_none());
    }

    #[test]
    fn invalid_documents_fall_back_to_defaults() {
        for doc in [
            "{ not json".to_owned(),
            doc_with(1, r#"["UNAVAILABLE"]"#),
            doc_with(3, r#"[]"#),
            doc_with(3, r#"["NOT_A_CODE"]"#),
        ] {
            assert!(RetryPolicy::try_from_service_config(&doc, TRACES).is_err(), "{doc}");
            assert_eq!(RetryPolicy::from_service_config(&doc, TRACES), RetryPolicy::default());
        }
        assert_eq!(RetryPolicy::from_service_config("", TRACES), RetryPolicy::default());
    }

    #[test]
    fn durations_parse_exactly() {
        assert_eq!(parse_duration("0.3s").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1.000000001s").unwrap(), Duration::new(1, 1));
        assert_eq!(parse_duration(".5s").unwrap(), Duration::from_millis(500));
        for bad in ["5", "s", "1.2.3s", "-1s", "0.1234567891s", "abc s"] {
            assert!(parse_duration(bad).is_err(), "{bad}");
        }
    }
}
