//! Mapping of every failure onto an HTTP status with a JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{error, warn};

use clibridge_core::DomainError;
use clibridge_protocol::{ErrorResponse, ProtocolError, VersionError};

use crate::certs::CertificateError;
use crate::registry::RegistryError;
use crate::supervisor::SpawnError;

/// Errors returned by gateway handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("invalid device id: {0}")]
    InvalidPrincipal(DomainError),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    /// HTTP status and machine-readable error code.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::InvalidPrincipal(_) | Self::BadRequest(_) | Self::Protocol(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            Self::Version(_) => (StatusCode::BAD_REQUEST, "unsupported_protocol"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Certificate(_) => (StatusCode::INTERNAL_SERVER_ERROR, "certificate_error"),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            Self::Registry(err) => match err {
                RegistryError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                RegistryError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
                RegistryError::WorkspaceDenied { .. } => (StatusCode::FORBIDDEN, "workspace_denied"),
                RegistryError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                RegistryError::ProcessGone(_) => (StatusCode::GONE, "process_gone"),
                RegistryError::RegistryFull { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "registry_full")
                }
                RegistryError::Spawn(SpawnError::CommandNotFound { .. }) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "tool_unavailable")
                }
                RegistryError::Spawn(_) => (StatusCode::INTERNAL_SERVER_ERROR, "spawn_failed"),
                RegistryError::ChannelClosed => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();

        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        } else if status == StatusCode::UNAUTHORIZED {
            warn!("Rejected unauthenticated request");
        }

        (status, Json(ErrorResponse::new(code, self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clibridge_core::SessionId;

    #[test]
    fn test_registry_status_mapping() {
        let id = SessionId::new("s1");
        let cases = [
            (RegistryError::SessionNotFound(id.clone()), StatusCode::NOT_FOUND),
            (RegistryError::Forbidden(id.clone()), StatusCode::FORBIDDEN),
            (RegistryError::Conflict(id.clone()), StatusCode::CONFLICT),
            (RegistryError::ProcessGone(id), StatusCode::GONE),
            (RegistryError::RegistryFull { max: 1 }, StatusCode::SERVICE_UNAVAILABLE),
            (
                RegistryError::Spawn(SpawnError::CommandNotFound {
                    command: "claude".to_string(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RegistryError::Spawn(SpawnError::PermissionDenied {
                    command: "claude".to_string(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status().0, expected);
        }
    }

    #[test]
    fn test_client_errors() {
        assert_eq!(ApiError::Unauthorized.status().0, StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(ProtocolError::AmbiguousInput).status().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
