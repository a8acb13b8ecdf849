//! Bot and bearer token authentication.

use std::fmt;

/// Credentials for the `Authorization` header.
///
/// The token also serves as the default rate-limit key, so separate tokens
/// never share bucket state.
#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    /// A bot token.
    Bot(String),
    /// An OAuth2 bearer token.
    Bearer(String),
}

impl Authentication {
    /// The `Authorization` header value.
    #[must_use]
    pub fn header_value(&self) -> String {
        match self {
            Self::Bot(token) => format!("Bot {token}"),
            Self::Bearer(token) => format!("Bearer {token}"),
        }
    }

    /// The rate-limit key partitioning all limiter state for this token.
    #[must_use]
    pub fn rate_limit_key(&self) -> String {
        self.header_value()
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens stay out of logs.
        match self {
            Self::Bot(_) => f.write_str("Authentication::Bot(..)"),
            Self::Bearer(_) => f.write_str("Authentication::Bearer(..)"),
        }
    }
}
