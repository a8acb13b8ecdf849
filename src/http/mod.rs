//! Rate-limited REST engine for the Discord API.
//!
//! A request flows through the process-wide [`GlobalRateLimiter`], then the
//! per-route bucket machinery in [`RateLimitStorage`], before it is sent.
//! Response headers feed back into both, keeping the limiter state correct
//! even on error paths.

mod auth;
mod bucket;
mod engine;
mod error;
mod file;
mod global;
mod route;
mod storage;

pub use auth::Authentication;
pub use bucket::{RateLimitHeaders, RequestSession};
pub use engine::{HttpEngine, RequestEvent, RequestOptions};
pub use error::{ApiErrorBody, HttpError};
pub use file::AttachedFile;
pub use global::{GlobalRateLimiter, LimitedGlobalRateLimiter, UnlimitedGlobalRateLimiter};
pub use route::Route;
pub use storage::RateLimitStorage;

pub use reqwest::Method;
