use std::panic::Location;

use tracing::error;

/// Every error kind named in the service's error handling design, mapped
/// to its HTTP status by `status_code`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("payload too large")]
    TooLarge,

    #[error("transient database error")]
    TransientDb(#[from] sqlx::Error),

    #[error("transient filesystem error")]
    TransientIo(#[from] std::io::Error),

    #[error("invariant violation: {0}")]
    Corrupt(String),
}

impl AppError {
    pub fn status_code(&self) -> hyper::StatusCode {
        use hyper::StatusCode;
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Rejected(_) => StatusCode::NOT_ACCEPTABLE,
            AppError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::TransientDb(_) | AppError::TransientIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `Invalid-*` tag used in the tus-conformant plain text error body, when applicable.
    pub fn tus_tag(&self) -> Option<&'static str> {
        match self {
            AppError::BadRequest(_) => Some("Invalid-Request"),
            AppError::Conflict(_) => Some("Invalid-Offset"),
            AppError::TooLarge => Some("Invalid-Length"),
            _ => None,
        }
    }

    /// Whether this error is worth logging at error/warn level, per the
    /// error handling design: BadRequest/Unauthorized/NotFound/Conflict are
    /// ordinary client-facing outcomes and stay quiet.
    pub fn log_level(&self) -> tracing::Level {
        match self {
            AppError::Unauthorized | AppError::NotFound => tracing::Level::DEBUG,
            AppError::TransientDb(_) | AppError::TransientIo(_) => tracing::Level::WARN,
            AppError::Corrupt(_) => tracing::Level::ERROR,
            _ => tracing::Level::DEBUG,
        }
    }
}

#[inline]
#[track_caller]
pub(crate) fn log(source: &dyn std::error::Error) {
    log_at(tracing::Level::ERROR, source)
}

/// Logs `source` at the given level. Used by `error_response` so ordinary
/// client-facing outcomes (`BadRequest`, `NotFound`, ...) don't pollute
/// error-level logs the way a genuine server fault should.
#[inline]
#[track_caller]
pub(crate) fn log_at(level: tracing::Level, source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    match level {
        tracing::Level::ERROR => error!(target: "tusistor", %location, error=%source, "span trace:\n{span_trace}"),
        tracing::Level::WARN => tracing::warn!(target: "tusistor", %location, error=%source, "span trace:\n{span_trace}"),
        tracing::Level::INFO => tracing::info!(target: "tusistor", %location, error=%source, "span trace:\n{span_trace}"),
        tracing::Level::DEBUG => tracing::debug!(target: "tusistor", %location, error=%source, "span trace:\n{span_trace}"),
        tracing::Level::TRACE => tracing::trace!(target: "tusistor", %location, error=%source, "span trace:\n{span_trace}"),
    }
}

/// Unwraps a `Result`, logging the error with caller location and converting
/// it into an `AppError` via `From` before returning early.
macro_rules! try_ {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                crate::error::log(&err);
                return Err(err.into());
            }
        }
    };
}

pub(crate) use try_;
