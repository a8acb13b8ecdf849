//! Low-level Discord API client core.
//!
//! This crate provides the two concurrency subsystems every Discord bot call
//! passes through, and nothing else:
//!
//! - An HTTP engine ([`http::HttpEngine`]) that admits requests through
//!   Discord's per-route bucket model and the process-wide global limit,
//!   discovers bucket identities from response headers, and classifies
//!   responses into typed failures.
//! - A gateway layer ([`gateway::Shard`], [`gateway::ShardManager`]) that
//!   maintains long-lived WebSocket sessions: heartbeating, resuming,
//!   identify concurrency across shards, and zlib-stream decompression.
//!
//! Both are glued by a generic pub/sub [`Dispatcher`] and the
//! [`TimesPerWindow`] admission gate. REST convenience wrappers and typed
//! entity schemas are intentionally out of scope; callers decode JSON
//! themselves.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod http;
pub mod times_per;
pub mod types;

pub use config::{HttpConfig, RetryConfig, ShardManagerOptions};
pub use dispatcher::Dispatcher;
pub use gateway::{Shard, ShardEvent, ShardManager, ShardState};
pub use http::{Authentication, HttpEngine, HttpError, RequestOptions, Route};
pub use times_per::TimesPerWindow;

/// Discord API version this crate speaks, for both REST and gateway.
pub const API_VERSION: u8 = 10;
