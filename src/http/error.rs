use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};

use crate::service::{PublishError, ResolveError};

pub type AppResult<T> = Result<T, AppError>;

/// Error returned by the HTTP handlers, serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    #[serde(with = "serde_status_code")]
    status: StatusCode,
    detail: Option<String>,
}

impl AppError {
    /// Create a new [`AppError`].
    pub fn new(status_code: StatusCode, message: Option<impl ToString>) -> AppError {
        Self {
            status: status_code,
            detail: message.map(|m| m.to_string()),
        }
    }

    /// The HTTP status of this error.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn from_err(status: StatusCode, err: &dyn std::error::Error) -> Self {
        // append the source chain
        let mut detail = err.to_string();
        let mut source = err.source();
        while let Some(err) = source {
            detail.push_str(": ");
            detail.push_str(&err.to_string());
            source = err.source();
        }
        Self::new(status, Some(detail))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let json = Json(self.clone());
        (self.status, json).into_response()
    }
}

impl From<PublishError> for AppError {
    fn from(value: PublishError) -> Self {
        let status = match &value {
            PublishError::Validation { .. } => StatusCode::BAD_REQUEST,
            PublishError::IdentifierDecode { .. } | PublishError::Storage { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::from_err(status, &value)
    }
}

impl From<ResolveError> for AppError {
    fn from(value: ResolveError) -> Self {
        let status = match &value {
            ResolveError::NotFound { .. } => StatusCode::NOT_FOUND,
            ResolveError::InvalidIdentifier { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::from_err(status, &value)
    }
}

/// Serialize/Deserializer for status codes.
///
/// This is needed because status code according to JSON API spec must
/// be the status code as a STRING.
pub mod serde_status_code {
    use http::StatusCode;
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Unexpected};

    /// Serialize [StatusCode]s.
    pub fn serialize<S: Serializer>(status: &StatusCode, ser: S) -> Result<S::Ok, S::Error> {
        String::serialize(&status.as_u16().to_string(), ser)
    }

    /// Deserialize [StatusCode]s.
    pub fn deserialize<'de, D>(de: D) -> Result<StatusCode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(de)?;
        StatusCode::from_bytes(str.as_bytes()).map_err(|_| {
            serde::de::Error::invalid_value(
                Unexpected::Str(str.as_str()),
                &"A valid http status code",
            )
        })
    }
}
