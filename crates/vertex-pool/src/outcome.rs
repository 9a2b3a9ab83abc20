//! Upstream response classification
//!
//! Vertex AI signals regional saturation with a plain 429. Unlike per-account
//! quota schemes there is no body to inspect: the status alone decides whether
//! an attempt counts toward a region switch and whether another key is worth
//! trying.

/// What a single upstream attempt means for key rotation and failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// 2xx: resets the consecutive-429 counter
    Success,
    /// 429: counts toward a region switch; retry with another key
    RateLimited,
    /// Anything else: returned to the client as-is, no failover action
    Failed,
}

impl UpstreamOutcome {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            UpstreamOutcome::Success => "success",
            UpstreamOutcome::RateLimited => "rate_limited",
            UpstreamOutcome::Failed => "failed",
        }
    }

    /// Whether the request handler should move on to the next key.
    pub fn retry_with_next_key(&self) -> bool {
        matches!(self, UpstreamOutcome::RateLimited)
    }
}

/// Classify an upstream HTTP status.
pub fn classify_status(status: u16) -> UpstreamOutcome {
    match status {
        200..=299 => UpstreamOutcome::Success,
        429 => UpstreamOutcome::RateLimited,
        _ => UpstreamOutcome::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_hundreds_are_success() {
        for status in [200, 201, 204, 299] {
            assert_eq!(classify_status(status), UpstreamOutcome::Success);
        }
    }

    #[test]
    fn only_429_is_rate_limited() {
        assert_eq!(classify_status(429), UpstreamOutcome::RateLimited);
        assert!(classify_status(429).retry_with_next_key());
    }

    #[test]
    fn other_statuses_fail_without_retry() {
        for status in [301, 400, 401, 403, 404, 408, 500, 503, 504] {
            let outcome = classify_status(status);
            assert_eq!(outcome, UpstreamOutcome::Failed, "status {status}");
            assert!(!outcome.retry_with_next_key());
        }
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(UpstreamOutcome::Success.label(), "success");
        assert_eq!(UpstreamOutcome::RateLimited.label(), "rate_limited");
        assert_eq!(UpstreamOutcome::Failed.label(), "failed");
    }
}
