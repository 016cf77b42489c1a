//! HTTP error mapping.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use stowage::{errors::Error, protocol::Reply};

/// Errors surfaced to HTTP clients, rendered as the common envelope.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 400.
    #[error("{0}")]
    BadRequest(String),
    /// 403.
    #[error("{0}")]
    Forbidden(String),
    /// 404.
    #[error("not found")]
    NotFound,
    /// 500.
    #[error("internal server error")]
    Internal,
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        match e {
            Error::Invalid(_)
            | Error::ChunkCrc { .. }
            | Error::FileHash { .. }
            | Error::ChunkMissing(_)
            | Error::SessionNotFound => Self::BadRequest(e.to_string()),
            Error::AlreadyExists | Error::SystemFile | Error::OutOfScope => {
                Self::Forbidden(e.to_string())
            }
            Error::Io(_) => Self::Internal,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();

        HttpResponse::build(status)
            .json(Reply::<()>::error(status.as_u16(), self.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases: Vec<(Error, StatusCode)> = vec![
            (
                Error::Invalid("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (Error::SessionNotFound, StatusCode::BAD_REQUEST),
            (Error::AlreadyExists, StatusCode::FORBIDDEN),
            (Error::SystemFile, StatusCode::FORBIDDEN),
            (
                Error::Io(std::io::Error::other("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(AppError::from(error).status_code(), status);
        }
    }

    #[test]
    fn crc_mismatch_message_names_both_values() {
        let app: AppError = Error::ChunkCrc {
            declared: "deadbeef".into(),
            actual: "cbf43926".into(),
        }
        .into();

        let message = app.to_string();
        assert!(message.contains("deadbeef"));
        assert!(message.contains("cbf43926"));
    }
}
