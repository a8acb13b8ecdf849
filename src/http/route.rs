//! API route identity relative to rate limiting.

use std::fmt::Write as _;

use reqwest::Method;

/// A Discord API endpoint: HTTP method plus a path template with named
/// placeholders.
///
/// The client-side bucket key is derived from the method, the template, and
/// the major parameters only (`channel_id`, `guild_id`, `webhook_id`,
/// `webhook_token`); endpoints sharing a template but differing in a major
/// parameter are rate limited independently, while minor parameters never
/// split a bucket. The server-side bucket id discovered from
/// `X-RateLimit-Bucket` may later alias several of these keys together.
#[derive(Debug, Clone)]
pub struct Route {
    method: Method,
    template: &'static str,
    ignore_global: bool,
    guild_id: Option<u64>,
    channel_id: Option<u64>,
    webhook_id: Option<u64>,
    webhook_token: Option<String>,
    params: Vec<(&'static str, String)>,
}

impl Route {
    /// Create a route from a method and a path template such as
    /// `"/channels/{channel_id}/messages"`.
    #[must_use]
    pub fn new(method: Method, template: &'static str) -> Self {
        Self {
            method,
            template,
            ignore_global: false,
            guild_id: None,
            channel_id: None,
            webhook_id: None,
            webhook_token: None,
            params: Vec::new(),
        }
    }

    /// Set the `guild_id` major parameter.
    #[must_use]
    pub fn guild_id(mut self, id: u64) -> Self {
        self.guild_id = Some(id);
        self
    }

    /// Set the `channel_id` major parameter.
    #[must_use]
    pub fn channel_id(mut self, id: u64) -> Self {
        self.channel_id = Some(id);
        self
    }

    /// Set the `webhook_id` major parameter.
    #[must_use]
    pub fn webhook_id(mut self, id: u64) -> Self {
        self.webhook_id = Some(id);
        self
    }

    /// Set the `webhook_token` major parameter.
    #[must_use]
    pub fn webhook_token(mut self, token: impl Into<String>) -> Self {
        self.webhook_token = Some(token.into());
        self
    }

    /// Substitute a minor path parameter. Minor parameters format the path
    /// but never partition rate limits.
    #[must_use]
    pub fn param(mut self, name: &'static str, value: impl ToString) -> Self {
        self.params.push((name, value.to_string()));
        self
    }

    /// Exempt this route from the global rate limiter. Unauthenticated and
    /// webhook routes do not count towards the global limit.
    #[must_use]
    pub fn ignore_global(mut self) -> Self {
        self.ignore_global = true;
        self
    }

    /// The HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The unformatted path template.
    #[must_use]
    pub const fn template(&self) -> &'static str {
        self.template
    }

    /// Whether this route bypasses the global rate limiter.
    #[must_use]
    pub const fn ignores_global(&self) -> bool {
        self.ignore_global
    }

    /// The path with all placeholders substituted.
    #[must_use]
    pub fn path(&self) -> String {
        let mut path = self.template.to_owned();
        if let Some(id) = self.guild_id {
            path = path.replace("{guild_id}", &id.to_string());
        }
        if let Some(id) = self.channel_id {
            path = path.replace("{channel_id}", &id.to_string());
        }
        if let Some(id) = self.webhook_id {
            path = path.replace("{webhook_id}", &id.to_string());
        }
        if let Some(token) = &self.webhook_token {
            path = path.replace("{webhook_token}", token);
        }
        for (name, value) in &self.params {
            path = path.replace(&format!("{{{name}}}"), value);
        }
        path
    }

    /// The client-side bucket key: method, template and major parameters.
    #[must_use]
    pub fn bucket_key(&self) -> String {
        let mut key = format!("{}:{}", self.method, self.template);
        if let Some(id) = self.guild_id {
            let _ = write!(key, ":g{id}");
        }
        if let Some(id) = self.channel_id {
            let _ = write!(key, ":c{id}");
        }
        if let Some(id) = self.webhook_id {
            let _ = write!(key, ":w{id}");
        }
        if let Some(token) = &self.webhook_token {
            let _ = write!(key, ":t{token}");
        }
        key
    }
}
