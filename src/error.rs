// Error taxonomy shared by frontends, backends, middleware, and the router.
// Every error carries enough provenance to tell which side of the wire failed.

use std::time::Duration;

/// Gateway error kinds.
///
/// `is_retryable` drives both the retry middleware and router fallback; the
/// classification of provider HTTP responses is centralized in
/// [`classify_http`] so every backend reports the same class for the same
/// status code.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication rejected by {provider}: {message}")]
    Authentication { provider: String, message: String },

    #[error("authorization rejected by {provider}: {message}")]
    Authorization { provider: String, message: String },

    #[error("rate limited by {provider}: {message}")]
    RateLimit {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid request: {message}")]
    Validation {
        /// Offending field, when a single field can be blamed.
        field: Option<String>,
        message: String,
    },

    #[error("provider {provider} failed: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("stream error: {message}")]
    Stream { message: String },

    #[error("conversion failed in {adapter}: {message}")]
    Conversion { adapter: String, message: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema validation failed: {message}")]
    SchemaValidation { message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimit { .. }
                | GatewayError::Provider { .. }
                | GatewayError::Network(_)
                | GatewayError::Stream { .. }
                | GatewayError::Timeout { .. }
        )
    }

    /// Stable machine-readable code, used as the `code` of terminal stream
    /// error chunks and in router events.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Authentication { .. } => "authentication",
            GatewayError::Authorization { .. } => "authorization",
            GatewayError::RateLimit { .. } => "rate_limit",
            GatewayError::Validation { .. } => "validation",
            GatewayError::Provider { .. } => "provider",
            GatewayError::Network(_) => "network",
            GatewayError::Stream { .. } => "stream",
            GatewayError::Conversion { .. } => "conversion",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Cancelled => "aborted",
            GatewayError::Json(_) => "json",
            GatewayError::SchemaValidation { .. } => "schema_validation",
            GatewayError::Config(_) => "config",
        }
    }

    /// The `retry-after` hint, when the provider supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Rebuild an error from a terminal stream chunk's `(code, message)` pair.
    ///
    /// Stream consumers only see chunk codes; the router and `collect` use
    /// this to recover a typed error with the right retryability.
    pub fn from_chunk(code: &str, message: &str) -> Self {
        match code {
            "authentication" => GatewayError::Authentication {
                provider: String::new(),
                message: message.to_string(),
            },
            "authorization" => GatewayError::Authorization {
                provider: String::new(),
                message: message.to_string(),
            },
            "rate_limit" => GatewayError::RateLimit {
                provider: String::new(),
                message: message.to_string(),
                retry_after: None,
            },
            "validation" => GatewayError::Validation {
                field: None,
                message: message.to_string(),
            },
            "provider" => GatewayError::Provider {
                provider: String::new(),
                status: None,
                message: message.to_string(),
            },
            "timeout" => GatewayError::Timeout {
                message: message.to_string(),
            },
            "aborted" => GatewayError::Cancelled,
            "schema_validation" => GatewayError::SchemaValidation {
                message: message.to_string(),
            },
            _ => GatewayError::Stream {
                message: message.to_string(),
            },
        }
    }
}

/// Classify a non-2xx provider response into the shared taxonomy.
///
/// 401 -> authentication, 403 -> authorization, 408 -> timeout,
/// 429 -> rate limit (with `retry-after` when present), 5xx -> provider,
/// any other 4xx -> validation.
pub fn classify_http(
    provider: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> GatewayError {
    let message = if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body.trim())
    };

    match status {
        401 => GatewayError::Authentication {
            provider: provider.to_string(),
            message,
        },
        403 => GatewayError::Authorization {
            provider: provider.to_string(),
            message,
        },
        408 => GatewayError::Timeout { message },
        429 => GatewayError::RateLimit {
            provider: provider.to_string(),
            message,
            retry_after,
        },
        s if (500..600).contains(&s) => GatewayError::Provider {
            provider: provider.to_string(),
            status: Some(s),
            message,
        },
        _ => GatewayError::Validation {
            field: None,
            message,
        },
    }
}

/// Parse a `retry-after` header value: either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.signed_duration_since(chrono::Utc::now());
    delta.to_std().ok()
}
