use crate::error::AppError;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;
use tracing::warn;

/// Checks the configured API key header on every request it wraps.
///
/// An empty key disables the check.
#[derive(Clone)]
pub struct ApiKeyAuth {
    inner: Rc<AuthSettings>,
}

struct AuthSettings {
    key: String,
    header: String,
}

impl ApiKeyAuth {
    pub fn new(key: impl Into<String>, header: impl Into<String>) -> Self {
        Self { inner: Rc::new(AuthSettings { key: key.into(), header: header.into() }) }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiKeyAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = ApiKeyAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ApiKeyAuthMiddleware { service, settings: Rc::clone(&self.inner) }))
    }
}

pub struct ApiKeyAuthMiddleware<S> {
    service: S,
    settings: Rc<AuthSettings>,
}

impl<S, B> Service<ServiceRequest> for ApiKeyAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if self.settings.key.is_empty() {
            return Box::pin(self.service.call(req));
        }

        let presented = req
            .headers()
            .get(self.settings.header.as_str())
            .and_then(|value| value.to_str().ok());

        match presented {
            Some(key) if keys_match(key, &self.settings.key) => Box::pin(self.service.call(req)),
            Some(_) => {
                warn!(uri = %req.uri(), "Rejected request with invalid API key");
                Box::pin(async {
                    Err(AppError::Unauthorized("invalid API key".to_string()).into())
                })
            }
            None => {
                warn!(uri = %req.uri(), "Rejected request without API key");
                Box::pin(async {
                    Err(AppError::Unauthorized("missing API key".to_string()).into())
                })
            }
        }
    }
}

/// Compare without short-circuiting on the first differing byte.
fn keys_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    let mut diff = a.len() ^ b.len();
    for (i, &byte) in b.iter().enumerate() {
        diff |= (a.get(i).copied().unwrap_or(0) ^ byte) as usize;
    }
    diff == 0
}
