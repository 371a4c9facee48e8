//! Bearer-token gate in front of every route

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::sync::Arc;

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingHeader,

    #[error("Invalid Authorization header format")]
    MalformedHeader,

    #[error("Invalid API key")]
    InvalidKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, format!("Unauthorized: {}\n", self)).into_response()
    }
}

/// Immutable set of accepted API keys
///
/// An empty set disables authorization: every request is let through.
#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    keys: HashSet<String>,
}

impl AuthGate {
    /// Build the gate from raw keys; keys are trimmed and empty ones dropped
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = keys
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keys }
    }

    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Check the request's `Authorization` header
    ///
    /// The value must be exactly two whitespace-separated tokens, the first
    /// being `Bearer` in any case. An absent or blank header is `MissingHeader`.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let value = headers.get(header::AUTHORIZATION).ok_or(AuthError::MissingHeader)?;
        let value = value.to_str().map_err(|_| AuthError::MalformedHeader)?;
        // A blank header carries no credential at all
        if value.trim().is_empty() {
            return Err(AuthError::MissingHeader);
        }

        let mut tokens = value.split_whitespace();
        let (scheme, key) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(scheme), Some(key), None) => (scheme, key),
            _ => return Err(AuthError::MalformedHeader),
        };
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::MalformedHeader);
        }

        if self.keys.contains(key) {
            Ok(())
        } else {
            Err(AuthError::InvalidKey)
        }
    }
}

/// Middleware: refuse unauthorized requests with 401 and strip the credential
/// from authorized ones before anything downstream sees them.
pub async fn require_api_key(State(gate): State<Arc<AuthGate>>, mut req: Request, next: Next) -> Response {
    if let Err(e) = gate.authorize(req.headers()) {
        tracing::info!(
            reason = %e,
            method = %req.method(),
            path = %req.uri().path(),
            "Rejected unauthorized request"
        );
        return e.into_response();
    }

    req.headers_mut().remove(header::AUTHORIZATION);
    next.run(req).await
}
