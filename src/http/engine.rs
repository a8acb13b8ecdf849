//! The request pipeline: admission, wire building, header feedback, and
//! status classification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Request, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::auth::Authentication;
use super::bucket::RateLimitHeaders;
use super::error::{ApiErrorBody, HttpError};
use super::file::AttachedFile;
use super::global::{GlobalRateLimiter, LimitedGlobalRateLimiter, UnlimitedGlobalRateLimiter};
use super::route::Route;
use super::storage::{RateLimitStorage, ResponseDisposition};
use crate::config::HttpConfig;
use crate::dispatcher::Dispatcher;
use crate::types::{GetGateway, GetGatewayBot};

/// User agent sent with every request, per Discord's required format.
const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/lowcord/lowcord, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Event dispatched on the engine's dispatcher after every response.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    /// HTTP method.
    pub method: String,

    /// Formatted request path.
    pub path: String,

    /// Response status.
    pub status: u16,
}

/// Per-request options for [`HttpEngine::request`].
#[derive(Debug, Default)]
pub struct RequestOptions {
    /// Credentials for the `Authorization` header. Also provides the
    /// default rate-limit key.
    pub authentication: Option<Authentication>,

    /// Overrides the rate-limit key. All limiter state is partitioned by
    /// this value; `None` with no authentication shares the anonymous pool.
    pub rate_limit_key: Option<String>,

    /// Bucket admission priority. Lower values are admitted first.
    pub priority: i32,

    /// Extra headers.
    pub headers: Vec<(String, String)>,

    /// Query string parameters.
    pub query: Vec<(String, String)>,

    /// JSON body. Sent as the `payload_json` multipart part when files are
    /// attached.
    pub json: Option<Value>,

    /// Files to upload.
    pub files: Vec<AttachedFile>,
}

impl RequestOptions {
    /// Options authenticated as the given token.
    #[must_use]
    pub fn authenticated(auth: &Authentication) -> Self {
        Self {
            authentication: Some(auth.clone()),
            ..Self::default()
        }
    }
}

/// The HTTP engine: every REST call passes through its two admission layers
/// before touching the network, and every response's rate-limit headers are
/// applied before the next waiter is admitted.
#[derive(Debug)]
pub struct HttpEngine {
    client: Client,
    config: HttpConfig,
    storages: Mutex<HashMap<Option<String>, Arc<RateLimitStorage>>>,
    /// Engine events: `request_response` fires after every response.
    pub dispatcher: Dispatcher<String, RequestEvent>,
}

impl HttpEngine {
    /// Create an engine from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Transport`] if the underlying client cannot be
    /// constructed.
    pub fn new(config: HttpConfig) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            config,
            storages: Mutex::new(HashMap::new()),
            dispatcher: Dispatcher::new(),
        })
    }

    /// The rate-limit storage for a key, created on first use.
    #[must_use]
    pub fn storage_for(&self, rate_limit_key: Option<String>) -> Arc<RateLimitStorage> {
        let mut storages = self.storages.lock();
        Arc::clone(
            storages
                .entry(rate_limit_key)
                .or_insert_with(|| Arc::new(RateLimitStorage::new(self.new_global_limiter()))),
        )
    }

    fn new_global_limiter(&self) -> Box<dyn GlobalRateLimiter> {
        match self.config.global_limit {
            Some(limit) => Box::new(LimitedGlobalRateLimiter::new(limit)),
            None => Box::new(UnlimitedGlobalRateLimiter::new()),
        }
    }

    /// Issue a request against `route`, honoring bucket and global limits.
    ///
    /// Returns the raw response; decoding the body is the caller's concern.
    ///
    /// # Errors
    ///
    /// - [`HttpError::CloudflareBan`] on a Cloudflare-level block.
    /// - [`HttpError::RateLimitingFailed`] when 429s exhaust the retry
    ///   budget.
    /// - [`HttpError::BadRequest`], [`HttpError::Unauthorized`],
    ///   [`HttpError::Forbidden`], [`HttpError::NotFound`],
    ///   [`HttpError::InternalServerError`] per status.
    /// - [`HttpError::Transport`] once transport retries are exhausted.
    #[instrument(skip(self, options), fields(method = %route.method(), path = %route.path()))]
    pub async fn request(&self, route: &Route, options: RequestOptions) -> Result<Response, HttpError> {
        let rate_limit_key = options
            .rate_limit_key
            .clone()
            .or_else(|| options.authentication.as_ref().map(Authentication::rate_limit_key));
        let storage = self.storage_for(rate_limit_key);
        let url = format!("{}{}", self.config.base_url, route.path());

        // Transport failures and 5xx responses share one retry budget;
        // 429 requeues have their own. Each exhausts independently.
        let mut delay = Duration::from_millis(self.config.retry.initial_delay_ms);
        let max_delay = Duration::from_millis(self.config.retry.max_delay_ms);
        let mut transport_attempts: u32 = 0;
        let mut rate_limit_attempts: u32 = 0;

        loop {
            if !route.ignores_global() {
                storage.global().acquire().await?;
            }
            let mut session = storage.acquire(route, options.priority).await?;

            // Network failures retry here without giving up the bucket slot;
            // they never consumed Discord-side quota.
            let response = loop {
                let request = self.build_request(&url, route, &options)?;
                match self.client.execute(request).await {
                    Ok(response) => break response,
                    Err(error) => {
                        transport_attempts += 1;
                        if transport_attempts > self.config.retry.max_attempts {
                            return Err(error.into());
                        }
                        warn!(
                            attempt = transport_attempts,
                            delay_ms = delay.as_millis(),
                            error = %error,
                            "transport failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(max_delay);
                    }
                }
            };

            let status = response.status();
            debug!(status = status.as_u16(), "response received");
            let rate_limit_headers = RateLimitHeaders::parse(response.headers());

            if status == StatusCode::TOO_MANY_REQUESTS {
                // A 429 that never reached the API has no `via` header: that
                // is the Cloudflare edge, and retrying digs the hole deeper.
                if !response.headers().contains_key("via") {
                    storage.settle(route, &mut session, ResponseDisposition::Untouched);
                    self.fire_response_event(route, status.as_u16());
                    return Err(HttpError::CloudflareBan);
                }

                let scope = response
                    .headers()
                    .get("X-RateLimit-Scope")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("user")
                    .to_owned();
                let retry_after_header = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<f64>().ok());
                let body = response.text().await.unwrap_or_default();

                self.fire_response_event(route, status.as_u16());

                match scope.as_str() {
                    "global" => {
                        storage.settle(route, &mut session, ResponseDisposition::Untouched);
                        // The body's retry_after has more precision than the
                        // header.
                        let retry_after = serde_json::from_str::<Value>(&body)
                            .ok()
                            .and_then(|value| value.get("retry_after").and_then(Value::as_f64))
                            .or(retry_after_header)
                            .unwrap_or(1.0);
                        storage
                            .global()
                            .on_global_429(Duration::from_secs_f64(retry_after.max(0.0)));
                    }
                    "shared" => {
                        // A secondary resource limit we do not model; wait it
                        // out without touching the route's bucket.
                        storage.settle(route, &mut session, ResponseDisposition::Untouched);
                        let retry_after = retry_after_header.unwrap_or(1.0);
                        info!(retry_after, "shared-resource rate limit hit");
                        tokio::time::sleep(Duration::from_secs_f64(retry_after.max(0.0))).await;
                    }
                    _ => {
                        // "user": trust the headers and requeue at the
                        // original priority.
                        match &rate_limit_headers {
                            Some(headers) => {
                                warn!(bucket = %headers.bucket, "bucket rate limit exceeded");
                                storage.settle(
                                    route,
                                    &mut session,
                                    ResponseDisposition::Headers(headers),
                                );
                            }
                            None => {
                                storage.settle(route, &mut session, ResponseDisposition::Untouched);
                            }
                        }
                    }
                }

                rate_limit_attempts += 1;
                if rate_limit_attempts > self.config.max_rate_limit_retries {
                    return Err(HttpError::RateLimitingFailed {
                        attempts: rate_limit_attempts,
                        status: status.as_u16(),
                        body,
                    });
                }
                continue;
            }

            let disposition = match &rate_limit_headers {
                Some(headers) => ResponseDisposition::Headers(headers),
                None if status.is_success() => ResponseDisposition::NoRateLimitHeaders,
                None => ResponseDisposition::Untouched,
            };
            storage.settle(route, &mut session, disposition);
            storage.global().update(response.headers());
            self.fire_response_event(route, status.as_u16());

            if status.is_success() {
                return Ok(response);
            }

            let status_code = status.as_u16();
            let body = response.bytes().await.unwrap_or_default();
            let error: ApiErrorBody = serde_json::from_slice(&body).unwrap_or_else(|_| ApiErrorBody {
                code: i64::from(status_code),
                message: String::from_utf8_lossy(&body).into_owned(),
            });

            match status_code {
                400 => return Err(HttpError::BadRequest { error }),
                401 => return Err(HttpError::Unauthorized { error }),
                403 => return Err(HttpError::Forbidden { error }),
                404 => return Err(HttpError::NotFound { error }),
                code if code >= 500 => {
                    transport_attempts += 1;
                    if transport_attempts > self.config.retry.max_attempts {
                        return Err(HttpError::InternalServerError {
                            status: code,
                            error,
                        });
                    }
                    warn!(
                        status = code,
                        attempt = transport_attempts,
                        delay_ms = delay.as_millis(),
                        "server error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
                code => return Err(HttpError::UnexpectedStatus { status: code, error }),
            }
        }
    }

    /// Get `/gateway`: the connection URL, no authentication required.
    ///
    /// # Errors
    ///
    /// Propagates [`HttpError`] from the request or body decoding.
    pub async fn get_gateway(&self) -> Result<GetGateway, HttpError> {
        let route = Route::new(reqwest::Method::GET, "/gateway").ignore_global();
        let response = self.request(&route, RequestOptions::default()).await?;
        Ok(response.json().await?)
    }

    /// Get `/gateway/bot`: connection URL, recommended shard count, and
    /// session start limits.
    ///
    /// # Errors
    ///
    /// Propagates [`HttpError`] from the request or body decoding.
    pub async fn get_gateway_bot(&self, auth: &Authentication) -> Result<GetGatewayBot, HttpError> {
        let route = Route::new(reqwest::Method::GET, "/gateway/bot");
        let response = self
            .request(&route, RequestOptions::authenticated(auth))
            .await?;
        Ok(response.json().await?)
    }

    fn fire_response_event(&self, route: &Route, status: u16) {
        let _completion = self.dispatcher.dispatch(
            "request_response".to_owned(),
            RequestEvent {
                method: route.method().to_string(),
                path: route.path(),
                status,
            },
        );
    }

    fn build_request(
        &self,
        url: &str,
        route: &Route,
        options: &RequestOptions,
    ) -> Result<Request, HttpError> {
        let mut builder = self.client.request(route.method().clone(), url);
        if let Some(auth) = &options.authentication {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth.header_value());
        }
        for (name, value) in &options.headers {
            builder = builder.header(name, value);
        }
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if options.files.is_empty() {
            if let Some(json) = &options.json {
                builder = builder.json(json);
            }
        } else {
            let mut form = Form::new();
            if let Some(json) = &options.json {
                form = form.text("payload_json", serde_json::to_string(json)?);
            }
            for (index, file) in options.files.iter().enumerate() {
                form = form.part(
                    format!("files[{index}]"),
                    Part::bytes(file.data.clone()).file_name(file.filename.clone()),
                );
            }
            builder = builder.multipart(form);
        }
        builder.build().map_err(HttpError::from)
    }
}
