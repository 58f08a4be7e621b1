/*!
 * @file logger.rs
 * @brief Structured logging setup and log redaction helpers
 */

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{DoppelError, Result};

/// Installs the global tracing subscriber from the logging configuration.
/// Called once at startup; a second call fails and is a programming error.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| DoppelError::Config(format!("invalid log-level: {}", e)))?;

    match config.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        "text" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_target(true)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
    Ok(())
}

/// Strips userinfo from a backend DSN so credentials never reach the logs.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    match rest.find('@') {
        Some(at) if rest[..at].contains(':') || !rest[..at].is_empty() => {
            format!("{}://[redacted]@{}", &url[..scheme_end], &rest[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_credentials() {
        assert_eq!(
            redact_url("postgres://user:secret@db:5432/doppel"),
            "postgres://[redacted]@db:5432/doppel"
        );
        assert_eq!(
            redact_url("postgres://db:5432/doppel"),
            "postgres://db:5432/doppel"
        );
        assert_eq!(redact_url("sqlite::memory:"), "sqlite::memory:");
    }
}
