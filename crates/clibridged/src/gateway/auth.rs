//! Request authentication and protocol version handling.
//!
//! [`Authenticated`] is an extractor: handlers that take it never run for
//! an unauthenticated request, and because it only reads headers it runs
//! before any body extractor.

use axum::extract::{FromRequestParts, Request};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::debug;

use clibridge_core::Principal;
use clibridge_protocol::{ProtocolVersion, PROTOCOL_HEADER};

use super::error::ApiError;
use super::AppState;

/// Header carrying the shared API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header naming the calling device; becomes the principal.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// The principal of an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub principal: Principal,
}

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authenticate(&parts.headers, &state.config.api_key)
    }
}

/// Checks the API key and derives the principal.
///
/// The key is taken from `X-API-Key`, or from `Authorization: Bearer`.
///
/// # Errors
///
/// - `ApiError::Unauthorized` for a missing or wrong key
/// - `ApiError::InvalidPrincipal` for a malformed `X-Device-Id`
pub fn authenticate(headers: &HeaderMap, expected_key: &str) -> Result<Authenticated, ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .ok_or(ApiError::Unauthorized)?;

    let key_matches: bool = presented.as_bytes().ct_eq(expected_key.as_bytes()).into();
    if expected_key.is_empty() || !key_matches {
        return Err(ApiError::Unauthorized);
    }

    let principal = match headers.get(DEVICE_ID_HEADER) {
        None => Principal::default(),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ApiError::BadRequest("device id must be ASCII".to_string()))?;
            Principal::parse(value).map_err(ApiError::InvalidPrincipal)?
        }
    };

    Ok(Authenticated { principal })
}

/// Middleware: rejects incompatible clients and stamps the protocol version.
pub async fn protocol_version(request: Request, next: Next) -> Response {
    let announced = request
        .headers()
        .get(PROTOCOL_HEADER)
        .map(|v| v.to_str().unwrap_or_default().to_string());

    let mut response = match announced {
        Some(announced) => match ProtocolVersion::negotiate(&announced) {
            Ok(version) => {
                if version.is_newer_than(&ProtocolVersion::CURRENT) {
                    debug!(
                        client = %version,
                        server = %ProtocolVersion::CURRENT,
                        "Client speaks a newer minor version"
                    );
                }
                next.run(request).await
            }
            Err(e) => ApiError::Version(e).into_response(),
        },
        None => next.run(request).await,
    };

    if let Ok(value) = HeaderValue::from_str(&ProtocolVersion::CURRENT.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(PROTOCOL_HEADER), value);
    }
    response
}
