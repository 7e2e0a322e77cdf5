//! Admission decisions and their caller-visible representation.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use super::identifier::IdentifierKind;

/// Header carrying the policy quota.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the requests left in the window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying the ISO-8601 end of the window.
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Header carrying `ip` or `token`.
pub const HEADER_TYPE: &str = "x-ratelimit-type";

/// Error code used in rejection bodies.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Why limiting was not applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No identifier could be derived from the request
    IdentityUnresolvable,
    /// The window store failed or timed out
    StoreUnavailable,
}

/// The result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Limiting did not apply; let the request through without headers.
    Skipped(SkipReason),
    /// The request was counted and may proceed.
    Admitted(RateLimitInfo),
    /// The window is full.
    Rejected(Rejection),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Decision::Rejected(_))
    }

    /// Header values to attach, if any.
    pub fn info(&self) -> Option<&RateLimitInfo> {
        match self {
            Decision::Skipped(_) => None,
            Decision::Admitted(info) => Some(info),
            Decision::Rejected(rejection) => Some(&rejection.info),
        }
    }
}

/// Counters describing the caller's window after a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub kind: IdentifierKind,
}

impl RateLimitInfo {
    /// `X-RateLimit-*` header pairs.
    pub fn headers(&self) -> [(&'static str, String); 4] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, iso8601(self.reset_at)),
            (HEADER_TYPE, self.kind.as_str().to_string()),
        ]
    }
}

/// A rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Window counters; `remaining` is always zero
    pub info: RateLimitInfo,
    /// Whole seconds until the window resets, at least 1
    pub retry_after_secs: u64,
    /// Policy rejection message
    pub message: String,
}

impl Rejection {
    /// JSON body sent with the 429 response.
    pub fn body(&self) -> RejectionBody<'_> {
        RejectionBody {
            success: false,
            message: &self.message,
            error: RATE_LIMIT_EXCEEDED,
            retry_after: self.retry_after_secs,
            limit: self.info.limit,
            remaining: 0,
            reset_time: iso8601(self.info.reset_at),
            kind: self.info.kind.as_str(),
        }
    }
}

/// Wire form of a rejection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody<'a> {
    pub success: bool,
    pub message: &'a str,
    pub error: &'static str,
    pub retry_after: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// RFC 3339 in UTC with millisecond precision and a `Z` suffix.
pub fn iso8601(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}
