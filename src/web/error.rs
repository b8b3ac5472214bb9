use axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

use crate::result::Error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::BotDetectionRequired => StatusCode::UNAUTHORIZED,
            Error::AccessForbidden => StatusCode::FORBIDDEN,
            Error::VariantUnavailable | Error::FileNotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::CatalogFailed(_)
            | Error::MetadataParseFailed(_)
            | Error::DownloadFailed(_)
            | Error::MergeFailed(_) => StatusCode::BAD_GATEWAY,
            // Nobody is left to read it
            Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Error::SpawnFailed { .. } | Error::Miette(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{self}");
        }

        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_errors_keep_their_kind() {
        let response = Error::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = Error::InvalidRequest("missing url".to_owned()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(Error::BotDetectionRequired.kind(), "bot_detection_required");
        assert_eq!(
            Error::MergeFailed("x".to_owned()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}

/// A JSON request body whose rejections answer like every other
/// [`Error::InvalidRequest`]
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(Error::InvalidRequest(rejection.body_text())),
        }
    }
}
