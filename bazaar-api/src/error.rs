use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bazaar_core::CoreError;
use serde_json::json;

/// Stable error code, stashed on the response for the metrics layer.
#[derive(Debug, Clone, Copy)]
pub struct ErrorKind(pub &'static str);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, bool) {
        match self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized", false),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden", false),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", false),
            AppError::Core(err) => {
                let status = match err {
                    CoreError::NotOwner { .. } | CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
                    CoreError::TerminalStateViolation { .. } | CoreError::Conflict(_) => StatusCode::CONFLICT,
                    CoreError::InvalidQuantity { .. }
                    | CoreError::InvalidAmount(_)
                    | CoreError::Invalid(_)
                    | CoreError::CurrencyMismatch { .. }
                    | CoreError::DuplicateLineKey(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.kind(), err.is_retryable())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, retryable) = self.parts();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal Server Error: {}", self);
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "kind": kind,
            "retryable": retryable,
        }));

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(ErrorKind(kind));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_map_to_status_codes() {
        let cases = [
            (
                CoreError::NotOwner {
                    line_key: "merch-1".into(),
                    requested_by: "vendor-y".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (CoreError::Conflict("line merch-1".into()), StatusCode::CONFLICT),
            (
                CoreError::InvalidQuantity {
                    line_key: "merch-1".into(),
                    requested: 5,
                    max: 2,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (CoreError::NotFound("order".into()), StatusCode::NOT_FOUND),
            (CoreError::Storage("pool timed out".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_storage_details_are_not_leaked() {
        let response = AppError::from(CoreError::Storage("password=hunter2".into())).into_response();
        assert_eq!(response.extensions().get::<ErrorKind>().map(|k| k.0), Some("storage"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Internal Server Error");
        assert_eq!(body["retryable"], false);
    }
}
