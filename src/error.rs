//! # Error Handling
//!
//! HTTP-facing error type and its mapping from the lower layers.
//!
//! ## Status Mapping:
//! - **503**: model weights unavailable or model failed to load
//! - **500**: inference failures, including a numeric failure that survived
//!   the full-precision retry
//! - **400**: bad uploads, undecodable audio, malformed JSON, invalid requests
//! - **401**: missing or wrong API key
//!
//! Every error renders as `{"error": {"type", "message", "timestamp"}}`.

use crate::audio::AudioDecodeError;
use crate::pipeline::PipelineError;
use crate::runtime::ModelError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    Unauthorized(String),
    ServiceUnavailable(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<ModelError> for AppError {
    fn from(err: ModelError) -> Self {
        if err.is_unavailable() {
            AppError::ServiceUnavailable(err.to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Model(err) => err.into(),
            PipelineError::InvalidRequest(msg) => AppError::BadRequest(msg),
        }
    }
}

impl From<AudioDecodeError> for AppError {
    fn from(err: AudioDecodeError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ModelKind, Precision};

    #[test]
    fn test_load_and_download_failures_are_unavailable() {
        let load: AppError = ModelError::load(ModelKind::Asr, "boom").into();
        assert_eq!(load.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let download: AppError = ModelError::download(ModelKind::Lid, "offline").into();
        assert_eq!(download.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_inference_failures_are_internal() {
        let numeric: AppError = ModelError::numeric(Precision::Full, "nan").into();
        assert_eq!(numeric.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let inference: AppError = ModelError::inference("bad shape").into();
        assert_eq!(inference.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_bad_audio_is_bad_request() {
        let err: AppError = AudioDecodeError::Empty.into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err: AppError = PipelineError::InvalidRequest("no stages".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::Unauthorized("missing API key".into()).error_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "unauthorized");
        assert_eq!(json["error"]["message"], "missing API key");
        assert!(json["error"]["timestamp"].is_string());
    }
}
