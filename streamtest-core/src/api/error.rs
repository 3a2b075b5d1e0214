use std::path::PathBuf;

use thiserror::Error;

use crate::error::TesterError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {url} returned status {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ApiError {
    /// Worth another attempt: connection problems, timeouts, throttling and
    /// server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<ApiError> for TesterError {
    fn from(error: ApiError) -> Self {
        let transient = error.is_transient();
        match error {
            ApiError::Io { .. } | ApiError::InvalidUrl { .. } => {
                TesterError::configuration(error.to_string())
            }
            other if transient => TesterError::transient(other.to_string()),
            other => TesterError::remote_failure(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn status(code: u16) -> ApiError {
        ApiError::Status {
            method: "GET",
            url: "https://livepeer.studio/api/task/t1".into(),
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn server_errors_map_to_transient() {
        assert_eq!(TesterError::from(status(503)).kind, ErrorKind::TransientNetwork);
        assert_eq!(TesterError::from(status(429)).kind, ErrorKind::TransientNetwork);
    }

    #[test]
    fn client_errors_map_to_remote_failure() {
        let err = TesterError::from(status(404));
        assert_eq!(err.kind, ErrorKind::RemoteFailure);
        assert!(err.message.contains("returned status 404"));
    }

    #[test]
    fn unreadable_files_are_configuration_errors() {
        let err = TesterError::from(ApiError::Io {
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            path: PathBuf::from("/data/bbb.mp4"),
        });
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
