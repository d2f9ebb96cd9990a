//! Standardized rate-limit response headers.
//!
//! Renders a [`RateLimitResult`] onto an [`http::HeaderMap`] under three
//! successive IETF rate-limit header drafts, and merges the results of
//! several limiters applied to one request into a single spec-correct
//! response: the policy header is additive, the informational headers
//! always describe the limiter closest to exhaustion.
//!
//! The merge works through an [`AppliedLimit`] slot owned by the request
//! scope. Callers thread a `&mut Option<AppliedLimit>` through every
//! [`set_headers`] call for the request and drop it at request end.

use std::fmt::Write as _;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};

use quota::{RateLimitInfo, RateLimitResult};

const RATELIMIT: HeaderName = HeaderName::from_static("ratelimit");
const RATELIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");
const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Which draft of the rate-limit header fields to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSpec {
    /// draft-ietf-httpapi-ratelimit-headers-06: separate `RateLimit-Limit`,
    /// `RateLimit-Remaining` and `RateLimit-Reset` fields.
    Draft6,
    /// draft-07: one combined `RateLimit` field.
    Draft7,
    /// draft-08: quoted policy names and hashed partition keys.
    Draft8,
}

impl FromStr for HeaderSpec {
    type Err = HeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft-6" => Ok(Self::Draft6),
            "draft-7" => Ok(Self::Draft7),
            "draft-8" => Ok(Self::Draft8),
            other => Err(HeaderError::UnknownDraft(other.to_string())),
        }
    }
}

impl std::fmt::Display for HeaderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Draft6 => "draft-6",
            Self::Draft7 => "draft-7",
            Self::Draft8 => "draft-8",
        };
        f.write_str(name)
    }
}

/// Failures of the header protocol.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    /// The draft name is not one of `draft-6`, `draft-7`, `draft-8`.
    #[error("unknown rate limit header draft: {0}")]
    UnknownDraft(String),
    /// A rendered value contained bytes not allowed in a header.
    #[error("header value could not be encoded")]
    InvalidValue(#[from] http::header::InvalidHeaderValue),
}

/// The most restrictive limiter rendered so far for one request.
///
/// Exactly one of these exists per request at a time, owned by the
/// request scope and discarded with it.
#[derive(Debug, Clone)]
pub struct AppliedLimit {
    limiter_id: String,
    spec: HeaderSpec,
    consumed_ratio: f64,
    info: RateLimitInfo,
}

impl AppliedLimit {
    /// Invocation id of the limiter whose result is recorded.
    pub fn limiter_id(&self) -> &str {
        &self.limiter_id
    }

    /// The draft format this request's headers are rendered in.
    pub fn spec(&self) -> HeaderSpec {
        self.spec
    }
}

/// Render one limiter result onto the response headers.
///
/// The policy header is appended for every limiter applied. The
/// informational headers are written unless a previously recorded limiter
/// is at least as restrictive; restrictiveness is the `remaining / max`
/// ratio, with a zero-max limiter counting as never restrictive. Once a
/// limiter is recorded, later limiters render in its draft format so one
/// response never mixes formats. Rejections always write their headers
/// plus `Retry-After`.
///
/// `limiter_id` identifies this limiter invocation so a later
/// [`update_info_headers`] can match it.
pub fn set_headers(
    headers: &mut HeaderMap,
    applied: &mut Option<AppliedLimit>,
    limiter_id: &str,
    draft: HeaderSpec,
    result: &RateLimitResult,
) -> Result<(), HeaderError> {
    let spec = applied.as_ref().map(|a| a.spec).unwrap_or(draft);

    let policy = render_policy(spec, &result.info);
    headers.append(RATELIMIT_POLICY, HeaderValue::from_str(&policy)?);

    if result.allowed {
        let ratio = consumed_ratio(&result.info);
        if let Some(current) = applied.as_ref()
            && ratio >= current.consumed_ratio
        {
            return Ok(());
        }

        *applied = Some(AppliedLimit {
            limiter_id: limiter_id.to_string(),
            spec,
            consumed_ratio: ratio,
            info: result.info.clone(),
        });
    }

    write_info(headers, spec, &result.info)?;

    if !result.allowed {
        headers.insert(RETRY_AFTER, HeaderValue::from(result.info.reset_in_seconds));
    }

    Ok(())
}

/// Rewrite the informational headers after a refund.
///
/// Only the limiter currently recorded in `applied` (matched by
/// invocation id) may update; the ratio comparison is deliberately not
/// re-evaluated. Anything else is a no-op.
pub fn update_info_headers(
    headers: &mut HeaderMap,
    applied: &Option<AppliedLimit>,
    limiter_id: &str,
    remaining_units: u64,
) -> Result<(), HeaderError> {
    let Some(current) = applied else {
        return Ok(());
    };
    if current.limiter_id != limiter_id {
        return Ok(());
    }

    let mut info = current.info.clone();
    info.remaining_units = remaining_units;
    write_info(headers, current.spec, &info)
}

/// Hashed, size-bounded representation of an identifier for the draft-8
/// partition key: base64 of the first twelve hex characters of the
/// identifier's SHA-256.
pub fn partition_key(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());

    let mut hex = String::with_capacity(12);
    for byte in &digest[..6] {
        let _ = write!(hex, "{byte:02x}");
    }
    BASE64.encode(hex.as_bytes())
}

fn consumed_ratio(info: &RateLimitInfo) -> f64 {
    if info.max_units == 0 {
        f64::INFINITY
    } else {
        info.remaining_units as f64 / info.max_units as f64
    }
}

fn render_policy(spec: HeaderSpec, info: &RateLimitInfo) -> String {
    match spec {
        HeaderSpec::Draft6 | HeaderSpec::Draft7 => {
            format!("{};w={}", info.max_units, info.window_seconds)
        }
        HeaderSpec::Draft8 => format!(
            "\"{}\";q={};w={};pk=:{}:",
            info.policy_name,
            info.max_units,
            info.window_seconds,
            partition_key(&info.identifier)
        ),
    }
}

fn write_info(
    headers: &mut HeaderMap,
    spec: HeaderSpec,
    info: &RateLimitInfo,
) -> Result<(), HeaderError> {
    match spec {
        HeaderSpec::Draft6 => {
            headers.insert(RATELIMIT_LIMIT, HeaderValue::from(info.max_units));
            headers.insert(RATELIMIT_REMAINING, HeaderValue::from(info.remaining_units));
            headers.insert(RATELIMIT_RESET, HeaderValue::from(info.reset_in_seconds));
        }
        HeaderSpec::Draft7 => {
            let value = format!(
                "limit={}, remaining={}, reset={}",
                info.max_units, info.remaining_units, info.reset_in_seconds
            );
            headers.insert(RATELIMIT, HeaderValue::from_str(&value)?);
        }
        HeaderSpec::Draft8 => {
            let value = format!(
                "\"{}\";r={};t={}",
                info.policy_name, info.remaining_units, info.reset_in_seconds
            );
            headers.insert(RATELIMIT, HeaderValue::from_str(&value)?);
        }
    }
    Ok(())
}
