//! Main axum router and HTTP request handlers for the link directory.
//!
//! Routes:
//! - `GET    /links`             - merged link listing (hidden links need admin)
//! - `PATCH  /links/{id}`        - upsert presentation overrides (admin)
//! - `DELETE /links/{id}`        - revert a link to upstream defaults (admin)
//! - `GET    /config`            - read admin-mutable settings (admin)
//! - `PATCH  /config`            - update admin-mutable settings (admin)
//! - `POST   /auth/token/renew`  - rotate the upstream session token
//! - `GET    /health`            - liveness check

use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    extract::{FromRequest, Path, Query, Request, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::auth::parse_basic_header;
use crate::error::ApiError;
use crate::merge::LinkView;
use crate::service::{ConfigPatch, RenewRequest};
use crate::store::MetaPatch;
use crate::AppState;

static SOURCE_HEADER: HeaderName = HeaderName::from_static("x-links-source");
static FETCHED_AT_HEADER: HeaderName = HeaderName::from_static("x-links-fetched-at");

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Result<Router> {
    let cors = build_cors_layer(&state.config.cors_origins)?;

    Ok(Router::new()
        .route("/links", get(handle_list_links))
        .route(
            "/links/{id}",
            patch(handle_patch_link).delete(handle_delete_link),
        )
        .route("/config", get(handle_get_config).patch(handle_patch_config))
        .route("/auth/token/renew", post(handle_renew_token))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state))
}

/// Cross-origin policy for the browser-based presentation layer.  A `"*"`
/// entry allows any origin but browsers refuse to combine it with
/// credentialed requests; an explicit allow-list can carry credentials.
fn build_cors_layer(origins: &[String]) -> Result<tower_http::cors::CorsLayer> {
    use tower_http::cors::{AllowOrigin, Any, CorsLayer};

    let methods = [Method::GET, Method::PATCH, Method::DELETE, Method::POST];
    let headers = [
        axum::http::header::AUTHORIZATION,
        axum::http::header::CONTENT_TYPE,
    ];

    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
            .expose_headers([SOURCE_HEADER.clone(), FETCHED_AT_HEADER.clone()]));
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o).with_context(|| format!("invalid CORS origin: {o}"))
        })
        .collect::<Result<_>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(true)
        .expose_headers([SOURCE_HEADER.clone(), FETCHED_AT_HEADER.clone()]))
}

// ---------------------------------------------------------------------------
// Body extraction
// ---------------------------------------------------------------------------

/// JSON body extractor whose rejections (syntax errors, unknown fields,
/// missing content type) carry the API's `{kind, detail}` error body
/// instead of axum's plain-text defaults.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: serde::de::DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::Validation(format!("invalid request body: {}", e.body_text())))?;
        Ok(Self(value))
    }
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    include_hidden: bool,
}

#[derive(Debug, Serialize)]
struct RenewResponse {
    token: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /links?include_hidden={bool}`
///
/// The provenance of the listing travels in response headers: the source
/// marker always, the original fetch timestamp only for cached data.
#[instrument(skip(state, headers))]
async fn handle_list_links(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let credentials = parse_basic_header(&headers);
    let listing = state
        .directory
        .list_links(query.include_hidden, credentials.as_ref())
        .await?;

    let mut response = Json(&listing.links).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        SOURCE_HEADER.clone(),
        HeaderValue::from_static(listing.source.as_str()),
    );
    if listing.source == crate::cache::Source::Cache {
        if let Ok(value) = HeaderValue::from_str(&listing.fetched_at.to_rfc3339()) {
            response_headers.insert(FETCHED_AT_HEADER.clone(), value);
        }
    }
    Ok(response)
}

/// `PATCH /links/{id}`
#[instrument(skip(state, headers, patch), fields(%id))]
async fn handle_patch_link(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    ApiJson(patch): ApiJson<MetaPatch>,
) -> Result<Json<LinkView>, ApiError> {
    let credentials = parse_basic_header(&headers);
    let view = state
        .directory
        .patch_link_meta(id, &patch, credentials.as_ref())
        .await?;
    Ok(Json(view))
}

/// `DELETE /links/{id}`
#[instrument(skip(state, headers), fields(%id))]
async fn handle_delete_link(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let credentials = parse_basic_header(&headers);
    state
        .directory
        .delete_link_meta(id, credentials.as_ref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /config`
#[instrument(skip(state, headers))]
async fn handle_get_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let credentials = parse_basic_header(&headers);
    let view = state.directory.get_config(credentials.as_ref()).await?;
    Ok(Json(view).into_response())
}

/// `PATCH /config`
#[instrument(skip(state, headers, patch))]
async fn handle_patch_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(patch): ApiJson<ConfigPatch>,
) -> Result<Response, ApiError> {
    let credentials = parse_basic_header(&headers);
    let view = state
        .directory
        .set_config(&patch, credentials.as_ref())
        .await?;
    Ok(Json(view).into_response())
}

/// `POST /auth/token/renew`
///
/// Authenticates against the upstream control plane, not the administrator
/// pair, so a deployment with no admin configured can still rotate tokens.
#[instrument(skip(state, request))]
async fn handle_renew_token(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<RenewRequest>,
) -> Result<Json<RenewResponse>, ApiError> {
    let token = state.directory.renew_upstream_token(&request).await?;
    Ok(Json(RenewResponse { token }))
}

/// `GET /health`
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}
