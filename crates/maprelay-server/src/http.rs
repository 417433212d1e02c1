//! HTTP request handlers
//!
//! Includes the login start/status endpoints, the sign-in proxy path and the
//! credential import API. The browser is identified by the
//! `maprelay_session` cookie, issued on first contact.

use axum::{
    extract::{Path as AxumPath, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{any, delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use maprelay_auth::{import_credentials, DeviceSummary, PoolError, SessionStatus};
use maprelay_core::Marketplace;
use maprelay_proxy::{ProxyError, ProxyRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::state::AppState;

/// Cookie carrying the browser session key
pub const SESSION_COOKIE: &str = "maprelay_session";

/// Header carrying the passphrase of an encrypted credential file
pub const CREDENTIAL_PASSWORD_HEADER: &str = "x-credential-password";

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Login flow
        .route("/login", delete(login_cancel_handler))
        .route("/login/start", post(login_start_handler))
        .route("/login/status", get(login_status_handler))
        // Sign-in proxy
        .route("/login/:id", any(proxy_root_handler))
        .route("/login/:id/*resource", any(proxy_resource_handler))
        // Device API
        .route("/api/import", post(import_handler))
        .route("/api/devices", get(list_devices_handler))
        .route("/api/marketplaces", get(marketplaces_handler))
        .with_state(state)
}

// ============================================================================
// Session cookie
// ============================================================================

fn session_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn set_session_cookie(response: &mut Response, key: &str) {
    let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, key);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn pool_error(err: PoolError) -> (StatusCode, String) {
    match err {
        PoolError::SessionAlreadyExists(_) => (StatusCode::CONFLICT, err.to_string()),
        PoolError::SessionNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        PoolError::Proxy(e) => proxy_error(e),
    }
}

fn proxy_error(err: ProxyError) -> (StatusCode, String) {
    let status = match &err {
        ProxyError::Core(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
        ProxyError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ProxyError::Http(_)
        | ProxyError::Registration { .. }
        | ProxyError::InvalidRegistration(_) => StatusCode::BAD_GATEWAY,
        ProxyError::LoginNotComplete | ProxyError::NotStarted => StatusCode::CONFLICT,
        ProxyError::SessionClosed => StatusCode::NOT_FOUND,
    };
    if status.is_server_error() {
        warn!("Sign-in proxy error: {}", err);
    }
    (status, err.to_string())
}

fn not_found(id: &str) -> (StatusCode, String) {
    pool_error(PoolError::SessionNotFound(id.to_string()))
}

// ============================================================================
// Login Flow Handlers
// ============================================================================

/// Body of a login start request (form or JSON)
#[derive(Debug, Deserialize)]
pub struct LoginStartRequest {
    pub country_code: String,
    #[serde(default)]
    pub with_username: bool,
}

fn parse_login_start(headers: &HeaderMap, body: &[u8]) -> ApiResult<LoginStartRequest> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));

    if is_json {
        return serde_json::from_slice(body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid request: {}", e)));
    }

    let mut country_code = None;
    let mut with_username = false;
    for (name, value) in url::form_urlencoded::parse(body) {
        match name.as_ref() {
            "country_code" => country_code = Some(value.into_owned()),
            "with_username" => {
                with_username = matches!(value.as_ref(), "on" | "true" | "1" | "yes")
            }
            _ => {}
        }
    }

    let country_code = country_code
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Missing country_code".to_string()))?;
    Ok(LoginStartRequest {
        country_code,
        with_username,
    })
}

/// Browser-facing proxy base for a session id
fn proxy_base(state: &AppState, headers: &HeaderMap, id: &Uuid) -> ApiResult<Url> {
    let public = match &state.config.public_url {
        Some(url) => url.clone(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| (StatusCode::BAD_REQUEST, "Missing Host header".to_string()))?;
            format!("http://{}", host)
        }
    };

    Url::parse(&format!("{}/login/{}", public.trim_end_matches('/'), id))
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid public URL: {}", e)))
}

/// Start a sign-in for the caller's browser session
///
/// Any previous attempt is discarded. Redirects to the proxied first page.
async fn login_start_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let request = parse_login_start(&headers, &body)?;
    let (key, issued) = match session_key(&headers) {
        Some(key) => (key, false),
        None => (Uuid::new_v4().simple().to_string(), true),
    };

    state.pool.remove_by_key(&key).await;
    let record = state
        .pool
        .create_session(
            &key,
            &request.country_code,
            request.with_username,
            state.session_ttl(),
        )
        .await
        .map_err(pool_error)?;

    let base = match proxy_base(&state, &headers, &record.id()) {
        Ok(base) => base,
        Err(e) => {
            state.pool.remove_by_key(&key).await;
            return Err(e);
        }
    };
    if let Err(e) = record.start(base.clone()).await {
        state.pool.remove_by_key(&key).await;
        return Err(pool_error(e));
    }

    let mut response = Redirect::to(base.as_str()).into_response();
    if issued {
        set_session_cookie(&mut response, &key);
    }
    Ok(response)
}

/// Login status response
#[derive(Debug, Serialize)]
pub struct LoginStatusResponse {
    /// `in_progress`, `complete`, `expired` or `none`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Seconds remaining until expiration
    pub expires_in: i64,
}

/// Status of the caller's sign-in
async fn login_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<LoginStatusResponse> {
    let record = match session_key(&headers) {
        Some(key) => state.pool.get_by_key(&key).await,
        None => None,
    };

    let Some(record) = record else {
        return Json(LoginStatusResponse {
            status: "none",
            id: None,
            expires_in: 0,
        });
    };

    let status = match record.status() {
        SessionStatus::InProgress => "in_progress",
        SessionStatus::Complete => "complete",
        SessionStatus::Expired => "expired",
    };
    Json(LoginStatusResponse {
        status,
        id: Some(record.id()),
        expires_in: record.expires_in(),
    })
}

/// Discard the caller's sign-in
async fn login_cancel_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> StatusCode {
    if let Some(key) = session_key(&headers) {
        if state.pool.remove_by_key(&key).await {
            debug!("Login cancelled by browser");
        }
    }
    StatusCode::NO_CONTENT
}

// ============================================================================
// Sign-in Proxy Handlers
// ============================================================================

/// Completed login response
#[derive(Debug, Serialize)]
pub struct LoginCompleteResponse {
    pub status: &'static str,
    pub device_id: String,
    pub device_name: String,
}

/// Redisplay the last page of a sign-in
async fn proxy_root_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    proxy(state, &id, None).await
}

/// Forward a browser request to the provider
async fn proxy_resource_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, resource)): AxumPath<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let request = ProxyRequest::new(method, resource)
        .with_query(query)
        .with_body(header_value(header::CONTENT_TYPE), body)
        .with_accept(header_value(header::ACCEPT));
    proxy(state, &id, Some(request)).await
}

async fn proxy(
    state: Arc<AppState>,
    id: &str,
    request: Option<ProxyRequest>,
) -> ApiResult<Response> {
    let uuid = Uuid::parse_str(id).map_err(|_| not_found(id))?;
    let record = state.pool.get_by_id(&uuid).await.ok_or_else(|| not_found(id))?;

    let mut session = record.session().lock().await;
    // A request queued behind the one that registered the device
    if session.is_registered() {
        return Err(not_found(id));
    }
    if let Some(request) = request {
        session.forward(request).await.map_err(proxy_error)?;
    }

    if session.is_logged_in() {
        let bundle = session.register_device().await.map_err(proxy_error)?;
        session.mark_registered();
        drop(session);

        let stored = state
            .store
            .save_bundle(bundle)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        state.pool.remove_by_key(record.external_key()).await;

        info!("Login {} complete, stored device {}", uuid, stored.id);
        let response = LoginCompleteResponse {
            status: "complete",
            device_id: stored.id.to_string(),
            device_name: stored.bundle.device_name().to_string(),
        };
        return Ok((StatusCode::CREATED, Json(response)).into_response());
    }

    let last = session
        .last_response()
        .ok_or_else(|| proxy_error(ProxyError::NotStarted))?;
    let status = StatusCode::from_u16(last.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response = (status, last.body.clone()).into_response();
    if let Some(content_type) = last
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    Ok(response)
}

// ============================================================================
// Device API Handlers
// ============================================================================

/// Import a previously exported credential file
async fn import_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let password = headers
        .get(CREDENTIAL_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok());

    let bundle = import_credentials(&body, password)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let stored = state
        .store
        .save_bundle(bundle)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((StatusCode::CREATED, Json(DeviceSummary::from(&stored))).into_response())
}

/// List registered devices
async fn list_devices_handler(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceSummary>> {
    let devices = state.store.list().await;
    Json(devices.iter().map(DeviceSummary::from).collect())
}

/// Marketplace choice for the login form
#[derive(Debug, Serialize)]
pub struct MarketplaceChoice {
    pub country_code: &'static str,
    pub display_name: &'static str,
}

/// List supported marketplaces
async fn marketplaces_handler() -> Json<Vec<MarketplaceChoice>> {
    Json(
        Marketplace::choices()
            .into_iter()
            .map(|(country_code, display_name)| MarketplaceChoice {
                country_code,
                display_name,
            })
            .collect(),
    )
}
