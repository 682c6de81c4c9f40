use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct RunnerError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpErrorResponse {
    pub error: String,
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse { error: message }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse {
            error: message.to_string(),
        }
    }
}

impl RunnerError {
    pub fn new(status: StatusCode, message: impl Into<HttpErrorResponse>) -> Self {
        RunnerError {
            status,
            message: message.into(),
        }
    }

    /// Rejects the request as malformed, keeping the full error chain as the message.
    pub fn bad_request(err: impl Into<anyhow::Error>) -> Self {
        RunnerError::new(StatusCode::BAD_REQUEST, format!("{:#}", err.into()))
    }
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

impl<E> From<E> for RunnerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        RunnerError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: HttpErrorResponse::from(format!("{:#}", err.into())),
        }
    }
}

pub type RunnerResult<T, E = RunnerError> = Result<T, E>;

#[macro_export]
macro_rules! bail_runner {
    ($error_message:expr) => {
        return Err($crate::error::RunnerError::new(
            ::axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            $error_message,
        ))
    };
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::error::RunnerError::new($status_code, $error_message))
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        return Err($crate::error::RunnerError::new($status, format!($fmt $(, $arg)*)))
    };
}
