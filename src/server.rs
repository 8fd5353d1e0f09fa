//! Axum router construction.
//!
//! The [`app`] function wires the gateway's own endpoints (API root,
//! logout, SSO tokens, PKI resource, health, metrics, OpenAPI) and the
//! middleware stack. Resource routes are added by collaborators through
//! [`crate::extract::BackendSession`].

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use utoipa::OpenApi;

use crate::auth::auth_middleware;
use crate::backend::{Method, LOGOUT};
use crate::context::{AuthScheme, RequestContext};
use crate::errors::GatewayError;
use crate::metrics::{metrics_handler, metrics_middleware, SESSIONS_ACTIVE, TOKENS_ACTIVE};
use crate::oauth;
use crate::AppState;

// -- OpenAPI document ---------------------------------------------------------

/// OpenAPI documentation for the gateway's own endpoints.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "stackgate",
        version = "0.1.0",
        description = "oVirt-compatible gateway for Apache CloudStack"
    ),
    paths(
        health_check,
        api_root,
        logout,
        pki_resource,
        oauth::oauth_token,
        oauth::oauth_revoke,
    ),
    components(schemas(oauth::TokenResponse, oauth::RevokeResponse)),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "API", description = "oVirt API entry points"),
        (name = "SSO", description = "OAuth token issuance"),
        (name = "Services", description = "Unauthenticated engine services"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with every gateway endpoint.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let server = &state.config.server;

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .route(&server.api_path, get(api_root).head(api_root))
        .route(&server.logout_path(), get(logout).post(logout))
        .route(&server.oauth_token_path(), post(oauth::oauth_token))
        .route(&server.oauth_revoke_path(), post(oauth::oauth_revoke))
        .route(&server.pki_resource_path(), get(pki_resource))
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}

// -- Common headers middleware -----------------------------------------------

/// Adds `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert(header::DATE, value);
    }
    headers.insert(header::SERVER, HeaderValue::from_static("stackgate"));

    response
}

// -- Infrastructure ----------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// -- API entry points --------------------------------------------------------

/// `HEAD|GET {api}` -- connectivity/credential check used by SDKs.
#[utoipa::path(
    get,
    path = "/ovirt-engine/api",
    tag = "API",
    operation_id = "ApiRoot",
    responses(
        (status = 200, description = "Authenticated"),
        (status = 401, description = "Missing or rejected credentials")
    )
)]
async fn api_root() -> StatusCode {
    StatusCode::OK
}

/// `GET|POST {api}/logout` -- end the caller's backend session.
///
/// Always answers 200. A backend logout failure is logged and the local
/// session is dropped anyway.
#[utoipa::path(
    post,
    path = "/ovirt-engine/api/logout",
    tag = "API",
    operation_id = "Logout",
    responses(
        (status = 200, description = "Logged out")
    )
)]
async fn logout(
    State(state): State<Arc<AppState>>,
    ctx: Option<Extension<Arc<RequestContext>>>,
) -> StatusCode {
    let Some(Extension(ctx)) = ctx else {
        return StatusCode::OK;
    };
    let (Some(fingerprint), Some(scheme)) = (ctx.fingerprint(), ctx.scheme()) else {
        return StatusCode::OK;
    };

    let identity = match scheme {
        AuthScheme::Basic => state.sessions.get(fingerprint).map(|r| r.identity),
        AuthScheme::Bearer => state.tokens.get(fingerprint).map(|t| t.identity),
    };
    let Some(identity) = identity else {
        debug!("Logout for {} without a session", fingerprint);
        return StatusCode::OK;
    };

    ctx.set_identity(identity);
    if let Err(e) = state.backend.execute(&ctx, LOGOUT, &[], Method::Post).await {
        warn!("Backend logout for {} failed: {}", fingerprint, e);
    }

    match scheme {
        AuthScheme::Basic => {
            state.sessions.delete(fingerprint);
            metrics::gauge!(SESSIONS_ACTIVE).set(state.sessions.len() as f64);
        }
        AuthScheme::Bearer => {
            state.tokens.delete(fingerprint);
            metrics::gauge!(TOKENS_ACTIVE).set(state.tokens.len() as f64);
        }
    }
    info!("Logged out {}", fingerprint);
    StatusCode::OK
}

// -- PKI ---------------------------------------------------------------------

const CA_CERTIFICATE: &str = "ca-certificate";
const X509_PEM_CA: &str = "X509-PEM-CA";

#[derive(Debug, Deserialize)]
struct PkiQuery {
    resource: Option<String>,
    format: Option<String>,
}

/// `GET {services}/pki-resource?resource=ca-certificate&format=X509-PEM-CA`
#[utoipa::path(
    get,
    path = "/ovirt-engine/services/pki-resource",
    tag = "Services",
    operation_id = "PkiResource",
    params(
        ("resource" = String, Query, description = "Resource type, `ca-certificate`"),
        ("format" = String, Query, description = "Encoding, `X509-PEM-CA`")
    ),
    responses(
        (status = 200, description = "PEM encoded CA certificate", content_type = "application/pkix-cert"),
        (status = 400, description = "Missing or unsupported parameters"),
        (status = 404, description = "No certificate available")
    )
)]
async fn pki_resource(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PkiQuery>,
) -> Result<Response, GatewayError> {
    let resource = query
        .resource
        .ok_or_else(|| GatewayError::bad_request("Missing required parameter: resource"))?;
    let format = query
        .format
        .ok_or_else(|| GatewayError::bad_request("Missing required parameter: format"))?;

    if !resource.eq_ignore_ascii_case(CA_CERTIFICATE) || !format.eq_ignore_ascii_case(X509_PEM_CA)
    {
        return Err(GatewayError::bad_request(format!(
            "Unsupported resource='{resource}' or format='{format}'"
        )));
    }

    let not_found = || GatewayError::NotFound {
        message: "Certificate file not found".to_string(),
    };
    let path = state.config.pki.ca_cert_file.as_ref().ok_or_else(not_found)?;
    let pem = tokio::fs::read(path).await.map_err(|e| {
        warn!("Cannot read CA certificate {}: {}", path.display(), e);
        not_found()
    })?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pkix-cert"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=ca-certificate.pem",
            ),
        ],
        pem,
    )
        .into_response())
}
