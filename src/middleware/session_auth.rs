//! Session-cookie authentication for the browser-facing surfaces (room
//! channels and the REST API). The identity provider issues the cookie at
//! login; this middleware only verifies it and exposes the user record.

use actix_web::{
    Error, HttpMessage,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
};
use futures_util::future::{Ready, ok, ready};
use log::{debug, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::services::auth::tokens;

/// Cookie carrying the signed session token.
pub const SESSION_COOKIE: &str = "session";

// Marker struct to indicate request has already been processed by auth middleware
#[derive(Debug)]
struct AuthProcessed;

#[derive(Clone)]
pub struct SessionAuthentication;

impl<S, B> Transform<S, ServiceRequest> for SessionAuthentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = SessionAuthenticationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(SessionAuthenticationMiddleware {
            service: Arc::new(service),
        })
    }
}

#[derive(Clone)]
pub struct SessionAuthenticationMiddleware<S> {
    service: Arc<S>,
}

impl<S, B> Service<ServiceRequest> for SessionAuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();

        if req.extensions().get::<AuthProcessed>().is_some() {
            return Box::pin(service.call(req));
        }

        // Skip auth check for OPTIONS requests (CORS pre-flight)
        let path = req.path().to_string();
        if req.method() == actix_web::http::Method::OPTIONS {
            debug!("Skipping authentication for OPTIONS request to: {}", path);
            req.extensions_mut().insert(AuthProcessed);
            return Box::pin(service.call(req));
        }

        req.extensions_mut().insert(AuthProcessed);

        let token = match req.request().cookie(SESSION_COOKIE) {
            Some(cookie) => cookie.value().to_string(),
            None => {
                warn!("No session cookie found for path: {}", path);
                return Box::pin(ready(Err(Error::from(
                    actix_web::error::ErrorUnauthorized("Missing session cookie"),
                ))));
            }
        };

        Box::pin(async move {
            match tokens::verify_session_token(&token) {
                Ok(user) => {
                    debug!("Session valid for {} on route {}", user.login, path);
                    req.extensions_mut().insert(user);
                    service.call(req).await
                }
                Err(err) => {
                    warn!("Session validation failed for route {}: {}", path, err);
                    Err(Error::from(actix_web::error::ErrorUnauthorized(
                        "Invalid session",
                    )))
                }
            }
        })
    }
}
