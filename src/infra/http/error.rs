use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::{
    application::repos::RepoError,
    domain::error::DomainError,
    purge::{PurgeError, ResolveError},
    queue::QueueError,
};

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNKNOWN_QUEUE: &str = "unknown_queue";
    pub const DUPLICATE: &str = "duplicate";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const INTEGRITY: &str = "integrity_error";
    pub const DB_TIMEOUT: &str = "db_timeout";
    pub const REPO: &str = "repo_error";
    pub const QUEUE: &str = "queue_error";
    pub const NOT_CONFIGURED: &str = "not_configured";
    pub const DRIVER: &str = "driver_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Diagnostic attached to error responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub code: &'static str,
    pub detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, None)
    }

    pub fn unknown_queue(name: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            codes::UNKNOWN_QUEUE,
            "Unknown queue",
            Some(format!("`{name}` is neither `objects` nor `urls`")),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Duplicate { constraint } => ApiError::new(
                StatusCode::CONFLICT,
                codes::DUPLICATE,
                "Duplicate record",
                Some(constraint),
            ),
            RepoError::NotFound => ApiError::not_found("Resource not found"),
            RepoError::InvalidInput { message } => ApiError::new(
                StatusCode::BAD_REQUEST,
                codes::INVALID_INPUT,
                "Invalid input",
                Some(message),
            ),
            RepoError::Integrity { message } => ApiError::new(
                StatusCode::CONFLICT,
                codes::INTEGRITY,
                "Integrity constraint violated",
                Some(message),
            ),
            RepoError::Timeout => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::DB_TIMEOUT,
                "Database timeout",
                None,
            ),
            RepoError::Persistence(message) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::REPO,
                "Persistence error",
                Some(message),
            ),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Repo(err) => err.into(),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::QUEUE,
                "Queue error",
                Some(other.to_string()),
            ),
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::bad_request("Invalid request", Some(err.to_string()))
    }
}

impl From<PurgeError> for ApiError {
    fn from(err: PurgeError) -> Self {
        match err {
            PurgeError::NotConfigured(reason) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::NOT_CONFIGURED,
                "Cache purging is not configured",
                Some(reason),
            ),
            PurgeError::Queue(err) => err.into(),
            PurgeError::Resolve(ResolveError::Repo(err)) => err.into(),
            PurgeError::Resolve(
                err @ (ResolveError::PostNotFound(_) | ResolveError::TermNotFound(_)),
            ) => ApiError::new(
                StatusCode::NOT_FOUND,
                codes::NOT_FOUND,
                "Content not found",
                Some(err.to_string()),
            ),
            PurgeError::Resolve(err @ ResolveError::InvalidUrl { .. }) => {
                ApiError::bad_request("Invalid purge URL", Some(err.to_string()))
            }
            PurgeError::Driver(err) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                codes::DRIVER,
                "Purge request failed upstream",
                Some(err.to_string()),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = format!(
            "{}: {}",
            self.code,
            self.hint.as_deref().unwrap_or(self.message)
        );
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        response.extensions_mut().insert(ErrorReport {
            code: self.code,
            detail,
        });
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purge::DriverError;

    #[test]
    fn purge_errors_map_to_statuses() {
        let cases = [
            (
                PurgeError::NotConfigured("none".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                PurgeError::Resolve(ResolveError::PostNotFound(4)),
                StatusCode::NOT_FOUND,
            ),
            (
                PurgeError::Resolve(ResolveError::InvalidUrl {
                    value: "ftp://x".to_string(),
                    reason: "scheme".to_string(),
                }),
                StatusCode::BAD_REQUEST,
            ),
            (
                PurgeError::Driver(DriverError::Transport("reset".to_string())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                PurgeError::Queue(QueueError::Repo(RepoError::Timeout)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn response_carries_report() {
        let response = ApiError::not_found("Queue item not found").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let report = response.extensions().get::<ErrorReport>().unwrap();
        assert_eq!(report.code, codes::NOT_FOUND);
    }
}
