use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// How bad an error is, for log routing and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Caller mistake, expected in normal traffic.
    Info,
    /// Degraded but recoverable (retried or served from fallback).
    Warning,
    /// A request failed and could not be recovered.
    Error,
    /// Misconfiguration or credential failure; needs operator attention.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Application error taxonomy.
///
/// Every variant is classified where the failure originates (HTTP status
/// mapping, connect/timeout detection) so downstream code branches on the
/// variant, never on message text.
#[derive(Debug)]
pub enum AppError {
    /// The supplied address or ZIP failed validation before any lookup.
    AddressValidationFailed(String),
    /// Territory resolution failed and every fallback strategy was exhausted.
    ResolutionFailed(String),
    /// An upstream call exceeded its deadline.
    ApiTimeout(String),
    /// Upstream rejected our credentials. Fatal, never retried.
    ApiUnauthorized(String),
    /// Upstream (or our own outbound limiter) refused the call rate.
    ApiRateLimited(String),
    /// Upstream returned a 5xx.
    ApiServerError(String),
    /// Connection-level failure (DNS, refused, reset).
    NetworkError(String),
    /// A required configuration value is absent or malformed.
    ConfigurationMissing(String),
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found.
    NotFound(String),
    /// Bad request (invalid input).
    BadRequest(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// Stable machine code carried in every error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AddressValidationFailed(_) => "ADDRESS_VALIDATION_FAILED",
            AppError::ResolutionFailed(_) => "RESOLUTION_FAILED",
            AppError::ApiTimeout(_) => "API_TIMEOUT",
            AppError::ApiUnauthorized(_) => "API_UNAUTHORIZED",
            AppError::ApiRateLimited(_) => "API_RATE_LIMITED",
            AppError::ApiServerError(_) => "API_SERVER_ERROR",
            AppError::NetworkError(_) => "NETWORK_ERROR",
            AppError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::WithContext { source, .. } => source.code(),
        }
    }

    /// Message safe to show an end user. Internal detail stays in `Display`.
    pub fn user_message(&self) -> String {
        match self {
            AppError::AddressValidationFailed(_) => {
                "Please check the address and ZIP code you entered.".to_string()
            }
            AppError::ResolutionFailed(_) => {
                "We couldn't determine the utility for that address.".to_string()
            }
            AppError::ApiTimeout(_) | AppError::ApiServerError(_) | AppError::NetworkError(_) => {
                "Plan data is temporarily unavailable. Please try again shortly.".to_string()
            }
            AppError::ApiUnauthorized(_) | AppError::ConfigurationMissing(_) => {
                "Plan data is temporarily unavailable.".to_string()
            }
            AppError::ApiRateLimited(_) => {
                "Too many requests right now. Please wait a moment and retry.".to_string()
            }
            AppError::DatabaseError(_) => "An internal error occurred.".to_string(),
            AppError::NotFound(msg) | AppError::BadRequest(msg) => msg.clone(),
            AppError::WithContext { source, .. } => source.user_message(),
        }
    }

    /// Whether a caller (or our own retry loop) may reasonably retry.
    pub fn retryable(&self) -> bool {
        match self {
            AppError::ApiTimeout(_)
            | AppError::ApiRateLimited(_)
            | AppError::ApiServerError(_)
            | AppError::NetworkError(_) => true,
            AppError::WithContext { source, .. } => source.retryable(),
            _ => false,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AppError::AddressValidationFailed(_)
            | AppError::BadRequest(_)
            | AppError::NotFound(_) => Severity::Info,
            AppError::ApiTimeout(_)
            | AppError::ApiRateLimited(_)
            | AppError::ApiServerError(_)
            | AppError::NetworkError(_) => Severity::Warning,
            AppError::ResolutionFailed(_) | AppError::DatabaseError(_) => Severity::Error,
            AppError::ApiUnauthorized(_) | AppError::ConfigurationMissing(_) => Severity::Critical,
            AppError::WithContext { source, .. } => source.severity(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AddressValidationFailed(_) | AppError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::ResolutionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ApiTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::ApiUnauthorized(_)
            | AppError::ApiServerError(_)
            | AppError::NetworkError(_) => StatusCode::BAD_GATEWAY,
            AppError::ApiRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ConfigurationMissing(_) | AppError::DatabaseError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::WithContext { source, .. } => source.status_code(),
        }
    }
}

impl fmt::Display for AppError {
    /// Formats the internal (operator-facing) message.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::AddressValidationFailed(msg) => write!(f, "Address validation failed: {}", msg),
            AppError::ResolutionFailed(msg) => write!(f, "Resolution failed: {}", msg),
            AppError::ApiTimeout(msg) => write!(f, "Upstream timeout: {}", msg),
            AppError::ApiUnauthorized(msg) => write!(f, "Upstream unauthorized: {}", msg),
            AppError::ApiRateLimited(msg) => write!(f, "Rate limited: {}", msg),
            AppError::ApiServerError(msg) => write!(f, "Upstream server error: {}", msg),
            AppError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            AppError::ConfigurationMissing(msg) => write!(f, "Configuration missing: {}", msg),
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Every variant maps to the envelope `{code, message, userMessage,
    /// retryable}` with a status from the taxonomy. Logging level follows
    /// the variant's severity.
    fn into_response(self) -> Response {
        match self.severity() {
            Severity::Info => tracing::debug!(code = self.code(), "request error: {}", self),
            Severity::Warning => tracing::warn!(code = self.code(), "degraded: {}", self),
            Severity::Error => tracing::error!(code = self.code(), "request failed: {}", self),
            Severity::Critical => {
                tracing::error!(code = self.code(), severity = "critical", "{}", self)
            }
        }

        let body = Json(json!({
            "code": self.code(),
            "message": self.to_string(),
            "userMessage": self.user_message(),
            "retryable": self.retryable(),
        }));

        (self.status_code(), body).into_response()
    }
}

// Make AppError cloneable for WithContext and coalesced-future fan-out.
impl Clone for AppError {
    /// Clones the error.
    ///
    /// Note: `sqlx::Error` is not cloneable, so `DatabaseError` is simplified to `RowNotFound` during cloning.
    fn clone(&self) -> Self {
        match self {
            AppError::AddressValidationFailed(msg) => AppError::AddressValidationFailed(msg.clone()),
            AppError::ResolutionFailed(msg) => AppError::ResolutionFailed(msg.clone()),
            AppError::ApiTimeout(msg) => AppError::ApiTimeout(msg.clone()),
            AppError::ApiUnauthorized(msg) => AppError::ApiUnauthorized(msg.clone()),
            AppError::ApiRateLimited(msg) => AppError::ApiRateLimited(msg.clone()),
            AppError::ApiServerError(msg) => AppError::ApiServerError(msg.clone()),
            AppError::NetworkError(msg) => AppError::NetworkError(msg.clone()),
            AppError::ConfigurationMissing(msg) => AppError::ConfigurationMissing(msg.clone()),
            AppError::DatabaseError(_e) => AppError::DatabaseError(sqlx::Error::RowNotFound), // Simplified clone
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::BadRequest(msg) => AppError::BadRequest(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    /// Converts a `sqlx::Error` into an `AppError`.
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    /// Classifies a transport-level `reqwest::Error` at origin.
    ///
    /// Status-bearing failures are mapped by code; everything that never
    /// produced a response is a timeout or network failure. Upstream status
    /// codes on *successful* transports are classified by the client that saw
    /// them, since `reqwest` only carries a status here via `error_for_status`.
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return AppError::ApiTimeout(err.to_string());
        }
        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), err.to_string());
        }
        AppError::NetworkError(err.to_string())
    }
}

/// Maps an upstream HTTP status to the error taxonomy.
pub fn classify_status(status: u16, detail: String) -> AppError {
    match status {
        401 | 403 => AppError::ApiUnauthorized(detail),
        429 => AppError::ApiRateLimited(detail),
        500..=599 => AppError::ApiServerError(detail),
        404 => AppError::NotFound(detail),
        _ => AppError::BadRequest(detail),
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    #[allow(dead_code)]
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: f(),
        })
    }
}
