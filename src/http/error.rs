//! HTTP failure kinds.

use serde::Deserialize;
use thiserror::Error;

use crate::times_per::GateClosed;

/// Discord's JSON error body, parsed leniently.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    /// Discord error code, or the HTTP status when the body was not JSON.
    #[serde(default)]
    pub code: i64,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Failures surfaced by [`crate::http::HttpEngine`].
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A body could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A rate limiter was closed while this request waited on it.
    #[error(transparent)]
    GateClosed(#[from] GateClosed),

    /// Discord's Cloudflare edge rejected the request outright. All traffic
    /// from this IP is blocked for a while; retrying makes it worse.
    #[error("temporarily banned by Cloudflare")]
    CloudflareBan,

    /// The request kept hitting 429s beyond the configured retry budget.
    #[error("rate limiting failed after {attempts} attempts (last status {status})")]
    RateLimitingFailed {
        /// How many admissions were attempted.
        attempts: u32,
        /// Status of the last response.
        status: u16,
        /// Body of the last response.
        body: String,
    },

    /// 400.
    #[error("bad request ({}): {}", .error.code, .error.message)]
    BadRequest {
        /// Parsed error body.
        error: ApiErrorBody,
    },

    /// 401.
    #[error("unauthorized ({}): {}", .error.code, .error.message)]
    Unauthorized {
        /// Parsed error body.
        error: ApiErrorBody,
    },

    /// 403.
    #[error("forbidden ({}): {}", .error.code, .error.message)]
    Forbidden {
        /// Parsed error body.
        error: ApiErrorBody,
    },

    /// 404.
    #[error("not found ({}): {}", .error.code, .error.message)]
    NotFound {
        /// Parsed error body.
        error: ApiErrorBody,
    },

    /// 5xx, after retries.
    #[error("internal server error (status {status}): {}", .error.message)]
    InternalServerError {
        /// HTTP status.
        status: u16,
        /// Parsed error body.
        error: ApiErrorBody,
    },

    /// Any other non-success status.
    #[error("unexpected status {status}: {}", .error.message)]
    UnexpectedStatus {
        /// HTTP status.
        status: u16,
        /// Parsed error body.
        error: ApiErrorBody,
    },
}
