//! Per-request metadata and caller identity

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header::HeaderName, HeaderMap, Method, Request, Version},
};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::config::{AuthConfig, ConfigError};
use crate::stats::CallerIdentity;

const USER_ID_SUFFIX: &str = "-user-id";
const USER_NAME_SUFFIX: &str = "-user-name";

/// Metadata for one proxied request, used for log correlation
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client: Option<SocketAddr>,
    pub method: Method,
    pub path: String,
    pub proto: Version,
}

impl RequestContext {
    pub fn from_request(req: &Request<Body>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client: req.extensions().get::<ConnectInfo<SocketAddr>>().map(|ci| ci.0),
            method: req.method().clone(),
            path: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            proto: req.version(),
        }
    }

    /// Span every log line of this request is emitted under
    pub fn span(&self) -> tracing::Span {
        let client = self
            .client
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        tracing::info_span!(
            "request",
            request_id = %self.request_id,
            client = %client,
            method = %self.method,
            path = %self.path,
            proto = ?self.proto,
        )
    }
}

/// Which inbound headers identify the caller
///
/// Each field is either an explicit header name or, when unset, any header
/// whose name ends in `-user-id` / `-user-name`.
///
/// Several matching values resolve deterministically: candidates are ordered
/// by header name, then by arrival order within one name, and the last
/// non-empty value wins.
#[derive(Debug, Clone, Default)]
pub struct IdentityHeaders {
    user_id: Option<HeaderName>,
    user_name: Option<HeaderName>,
}

impl IdentityHeaders {
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            user_id: parse_header_name(config.user_id_header.as_deref())?,
            user_name: parse_header_name(config.user_name_header.as_deref())?,
        })
    }

    pub fn resolve(&self, headers: &HeaderMap) -> CallerIdentity {
        CallerIdentity {
            user_id: resolve_one(headers, self.user_id.as_ref(), USER_ID_SUFFIX),
            user_name: resolve_one(headers, self.user_name.as_ref(), USER_NAME_SUFFIX),
        }
    }
}

fn parse_header_name(name: Option<&str>) -> Result<Option<HeaderName>, ConfigError> {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map(Some)
            .map_err(|e| ConfigError::Validation(format!("invalid identity header '{}': {}", name, e))),
        None => Ok(None),
    }
}

fn resolve_one(headers: &HeaderMap, explicit: Option<&HeaderName>, suffix: &str) -> Option<String> {
    let candidates: Vec<_> = match explicit {
        Some(name) => headers.get_all(name).iter().collect(),
        None => {
            let mut matching: Vec<_> = headers
                .iter()
                .filter(|(name, _)| name.as_str().ends_with(suffix))
                .collect();
            // Stable: values of one header keep their arrival order
            matching.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
            matching.into_iter().map(|(_, value)| value).collect()
        }
    };

    candidates
        .into_iter()
        .rev()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}
