//! Error types for configuration loading and request forwarding.

use std::{path::PathBuf, time::Duration};

use http::StatusCode;
use thiserror::Error;

/// Errors raised while loading and validating the proxy configuration.
///
/// All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Proxy prefix `{0}` must start with `/`")]
    InvalidPrefix(String),

    #[error("Duplicate proxy prefix `{0}`")]
    DuplicatePrefix(String),

    #[error("Invalid target `{target}` for `{prefix}`: {reason}")]
    InvalidTarget {
        prefix: String,
        target: String,
        reason: String,
    },

    #[error("Invalid path rewrite `{pattern}` for `{prefix}`: {source}")]
    InvalidRewrite {
        prefix: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors raised while forwarding a single request to its upstream.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to connect to upstream: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Timed out after {0:?} connecting to upstream")]
    Timeout(Duration),

    #[error("Upstream did not respond within {0:?}")]
    ResponseTimeout(Duration),

    #[error("TLS handshake with upstream failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("No TLS client configured for this upstream")]
    TlsUnavailable,

    #[error("HTTP handshake with upstream failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("Upstream request failed: {0}")]
    Upstream(#[source] hyper::Error),

    #[error("Could not build forwarded request: {0}")]
    InvalidUri(#[from] http::Error),
}

impl ProxyError {
    /// Status code reported to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Connect(_) | ProxyError::Timeout(_) | ProxyError::ResponseTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::InvalidUri(_) | ProxyError::TlsUnavailable => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Tls(_) | ProxyError::Handshake(_) | ProxyError::Upstream(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_upstream_is_gateway_timeout() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(
            ProxyError::Connect(refused).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::Timeout(Duration::from_secs(10)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::ResponseTimeout(Duration::from_secs(30)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_tls_failure_is_bad_gateway() {
        let err = std::io::Error::other("bad certificate");
        assert_eq!(ProxyError::Tls(err).status(), StatusCode::BAD_GATEWAY);
    }
}
