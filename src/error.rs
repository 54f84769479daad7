//! API error taxonomy.
//!
//! Every failure surfaced to the presentation layer carries a
//! machine-checkable `kind` and a human-readable `detail`.  Upstream
//! failures are values all the way up; only `Internal` represents a bug.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::upstream::UpstreamError;

/// JSON body returned for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub detail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad or missing administrator credentials.  Never retried.
    #[error("administrator credentials rejected: {0}")]
    AuthRejected(String),

    /// Administrator credentials are not configured on this deployment.
    #[error("administrator editing is not configured: {0}")]
    AuthUnconfigured(String),

    /// The upstream control plane rejected an explicit token renewal.
    #[error("upstream authentication failed: {0}")]
    UpstreamAuthFailure(String),

    /// The upstream control plane could not be reached or answered
    /// unusably, and no cached snapshot could substitute.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthRejected(_) => "auth_rejected",
            Self::AuthUnconfigured(_) => "auth_unconfigured",
            Self::UpstreamAuthFailure(_) => "upstream_auth_failure",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_failure",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthRejected(_) | Self::UpstreamAuthFailure(_) => StatusCode::UNAUTHORIZED,
            Self::AuthUnconfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UpstreamError> for ApiError {
    /// Conversion used on the listing path.  By the time an auth failure
    /// reaches here the lister's single renew-and-retry has already run,
    /// so it surfaces as unavailability rather than a credential prompt.
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Auth(detail) => {
                Self::UpstreamUnavailable(format!("upstream authentication failed: {detail}"))
            }
            UpstreamError::Unavailable(detail) => Self::UpstreamUnavailable(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref err) = self {
            error!(error = %err, "internal server error");
        }

        let status = self.status_code();
        let body = ErrorBody {
            kind: self.kind(),
            detail: self.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self, Self::AuthRejected(_)) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Basic realm=\"proxydash\""),
            );
        }
        response
    }
}
