//! Standardized error handling for the ingestion pipeline
//! Provides the crate error type, context helpers and the retry policy used
//! when establishing storage connections.

use std::time::Duration;

use tracing::warn;

/// Error type shared by every pipeline component
#[derive(Debug, thiserror::Error)]
pub enum InsightError {
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Upstream error: {message}")]
    Upstream {
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Timeout error: {message}")]
    Timeout { message: String, timeout_ms: u64 },
}

impl InsightError {
    /// Create a database error
    pub fn database<S: Into<String>>(message: S) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error with source
    pub fn database_with_source<S: Into<String>>(message: S, source: anyhow::Error) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn configuration_with_source<S: Into<String>>(message: S, source: anyhow::Error) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn upstream<S: Into<String>>(message: S, status: Option<u16>) -> Self {
        Self::Upstream {
            message: message.into(),
            status,
            source: None,
        }
    }

    pub fn io_with_source<S: Into<String>>(message: S, source: anyhow::Error) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with source
    pub fn internal_with_source<S: Into<String>>(message: S, source: anyhow::Error) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(message: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            timeout_ms,
        }
    }

    /// Short machine-readable code, used as a structured log field
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Configuration { .. } => "CONFIG_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
            Self::Timeout { .. } => "TIMEOUT_ERROR",
        }
    }

    /// Whether a retry of the same operation could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Upstream { status, .. } => status.map_or(true, |s| s >= 500),
            Self::Database { .. } => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for InsightError {
    fn from(err: sqlx::Error) -> Self {
        InsightError::database_with_source("query failed", err.into())
    }
}

impl From<reqwest::Error> for InsightError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return InsightError::timeout(format!("HTTP request timed out: {}", err), 0);
        }
        InsightError::Upstream {
            message: "HTTP request failed".to_string(),
            status: err.status().map(|s| s.as_u16()),
            source: Some(err.into()),
        }
    }
}

/// Result type alias for pipeline operations
pub type InsightResult<T> = std::result::Result<T, InsightError>;

/// Trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context<F>(self, f: F) -> InsightResult<T>
    where
        F: FnOnce() -> String;

    fn with_database_context<F>(self, f: F) -> InsightResult<T>
    where
        F: FnOnce() -> String;

    fn with_config_context<F>(self, f: F) -> InsightResult<T>
    where
        F: FnOnce() -> String;

    fn with_io_context<F>(self, f: F) -> InsightResult<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn with_context<F>(self, f: F) -> InsightResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| InsightError::internal_with_source(f(), e.into()))
    }

    fn with_database_context<F>(self, f: F) -> InsightResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| InsightError::database_with_source(f(), e.into()))
    }

    fn with_config_context<F>(self, f: F) -> InsightResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| InsightError::configuration_with_source(f(), e.into()))
    }

    fn with_io_context<F>(self, f: F) -> InsightResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| InsightError::io_with_source(f(), e.into()))
    }
}

/// Retry mechanism for storage operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Execute an operation, retrying transient failures with exponential backoff
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> InsightResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = InsightResult<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    let transient = error.is_transient();
                    last_error = Some(error);

                    if !transient {
                        break;
                    }
                    if attempt < self.max_attempts {
                        let delay = self.calculate_delay(attempt);
                        warn!(
                            "Operation failed on attempt {}/{}, retrying in {}ms",
                            attempt, self.max_attempts, delay
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| InsightError::internal("Retry operation failed with no error details")))
    }

    fn calculate_delay(&self, attempt: u32) -> u64 {
        let delay =
            (self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1)) as u64;
        delay.min(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_error_codes() {
        assert_eq!(InsightError::database("down").error_code(), "DATABASE_ERROR");
        assert_eq!(
            InsightError::validation_field("bad ip", "src_ip").error_code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(InsightError::timeout("slow", 5000).error_code(), "TIMEOUT_ERROR");
    }

    #[test]
    fn test_transient_classification() {
        assert!(InsightError::upstream("bad gateway", Some(502)).is_transient());
        assert!(!InsightError::upstream("unauthorized", Some(401)).is_transient());
        assert!(!InsightError::configuration("missing url").is_transient());
    }

    #[test]
    fn test_retry_policy_delay_calculation() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.calculate_delay(1), 100);
        assert_eq!(policy.calculate_delay(2), 200);
        assert_eq!(policy.calculate_delay(3), 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: InsightResult<()> = policy
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(InsightError::configuration("bad url"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_error() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result = policy
            .execute(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(InsightError::database("connection reset"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
