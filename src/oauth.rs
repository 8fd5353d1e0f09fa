//! OAuth2 token endpoints under the SSO prefix.
//!
//! oVirt SDKs obtain a bearer token with the resource-owner password grant
//! before calling the API. The token maps to the same backend identity a
//! Basic login would produce.

use axum::{extract::State, Form, Json};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::BasicCredentials;
use crate::context::RequestContext;
use crate::errors::GatewayError;
use crate::metrics::TOKENS_ACTIVE;
use crate::session::BearerToken;
use crate::AppState;

const PASSWORD_GRANT: &str = "password";

/// Form body of `POST {sso}/oauth/token`.
#[derive(Debug, Deserialize, Validate, utoipa::ToSchema)]
pub struct TokenRequest {
    #[garde(skip)]
    pub grant_type: Option<String>,
    /// `user[@domain]`.
    #[garde(required, length(min = 1))]
    pub username: Option<String>,
    #[garde(required, length(min = 1))]
    pub password: Option<String>,
    #[garde(skip)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub scope: String,
}

/// Form body of `POST {sso}/oauth/revoke`.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RevokeRequest {
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RevokeResponse {
    pub status: String,
}

/// 32 random bytes, base64url without padding.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[utoipa::path(
    post,
    path = "/ovirt-engine/sso/oauth/token",
    tag = "SSO",
    operation_id = "IssueToken",
    responses(
        (status = 200, description = "Token issued", body = TokenResponse),
        (status = 400, description = "Unsupported grant or missing parameters"),
        (status = 401, description = "Backend rejected the credentials")
    )
)]
pub async fn oauth_token(
    State(state): State<Arc<AppState>>,
    Form(req): Form<TokenRequest>,
) -> Result<Json<TokenResponse>, GatewayError> {
    if req.grant_type.as_deref() != Some(PASSWORD_GRANT) {
        warn!("Unsupported grant_type: {:?}", req.grant_type);
        return Err(GatewayError::bad_request(
            "Unsupported grant_type. Only 'password' is supported.",
        ));
    }
    req.validate().map_err(|report| {
        debug!("Token request rejected: {}", report);
        GatewayError::bad_request("Missing required parameters: username, password")
    })?;

    let (Some(login), Some(password)) = (req.username.as_deref(), req.password.as_deref()) else {
        return Err(GatewayError::bad_request(
            "Missing required parameters: username, password",
        ));
    };
    let credentials = BasicCredentials::new(login, password);

    let identity = state
        .backend
        .establish_session(&RequestContext::anonymous(), &credentials)
        .await
        .inspect_err(|e| warn!("Token request for {} failed: {}", login, e))?;

    let access_token = generate_token();
    let lifetime = Duration::from_secs(state.config.tokens.expiry_secs);
    state.tokens.put(
        state.fingerprinter.fingerprint(&access_token),
        BearerToken::new(identity, lifetime),
    );
    metrics::gauge!(TOKENS_ACTIVE).set(state.tokens.len() as f64);
    info!("OAuth token issued for {}", login);

    Ok(Json(TokenResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: lifetime.as_secs(),
        scope: req
            .scope
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| state.config.tokens.default_scope.clone()),
    }))
}

#[utoipa::path(
    post,
    path = "/ovirt-engine/sso/oauth/revoke",
    tag = "SSO",
    operation_id = "RevokeToken",
    responses(
        (status = 200, description = "Token revoked", body = RevokeResponse),
        (status = 400, description = "Missing token")
    )
)]
pub async fn oauth_revoke(
    State(state): State<Arc<AppState>>,
    Form(req): Form<RevokeRequest>,
) -> Result<Json<RevokeResponse>, GatewayError> {
    let token = req
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GatewayError::bad_request("Missing required parameter: token"))?;

    let fingerprint = state.fingerprinter.fingerprint(&token);
    if state.tokens.delete(&fingerprint).is_some() {
        info!("OAuth token {} revoked", fingerprint);
        metrics::gauge!(TOKENS_ACTIVE).set(state.tokens.len() as f64);
    }

    Ok(Json(RevokeResponse {
        status: "revoked".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::mount_handshake;
    use crate::testing::state_for;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn form_post(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn bearer_get(path: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_generated_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_token_request_validation() {
        let ok = TokenRequest {
            grant_type: Some("password".into()),
            username: Some("admin@ROOT".into()),
            password: Some("pw".into()),
            scope: None,
        };
        assert!(ok.validate().is_ok());

        let missing = TokenRequest {
            password: None,
            ..ok
        };
        assert!(missing.validate().is_err());

        let empty = TokenRequest {
            grant_type: None,
            username: Some(String::new()),
            password: Some("pw".into()),
            scope: None,
        };
        assert!(empty.validate().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_grant_is_400() {
        let server = MockServer::start().await;
        let app = crate::server::app(state_for(&server));
        let resp = app
            .oneshot(form_post(
                "/ovirt-engine/sso/oauth/token",
                "grant_type=client_credentials&username=a&password=b",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_password_is_400() {
        let server = MockServer::start().await;
        let app = crate::server::app(state_for(&server));
        let resp = app
            .oneshot(form_post(
                "/ovirt-engine/sso/oauth/token",
                "grant_type=password&username=admin",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_credentials_is_401() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"loginresponse": {"errorcode": 531, "errortext": "Unable to log in"}}),
            ))
            .mount(&server)
            .await;
        let state = state_for(&server);
        let app = crate::server::app(state.clone());

        let resp = app
            .oneshot(form_post(
                "/ovirt-engine/sso/oauth/token",
                "grant_type=password&username=admin%40ROOT&password=nope",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(state.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_issued_token_is_usable_until_revoked() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        let state = state_for(&server);
        let app = crate::server::app(state.clone());

        let resp = app
            .clone()
            .oneshot(form_post(
                "/ovirt-engine/sso/oauth/token",
                "grant_type=password&username=admin%40ROOT&password=pw",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let issued: TokenResponse = json_body(resp).await;
        assert_eq!(issued.token_type, "Bearer");
        assert_eq!(issued.expires_in, 86_400);
        assert_eq!(issued.scope, "ovirt-engine-api");
        let stored = state
            .tokens
            .get(&state.fingerprinter.fingerprint(&issued.access_token))
            .unwrap();
        assert_eq!(stored.identity.apikey, "API");
        assert_eq!(stored.identity.userid, "u-1");
        assert_eq!(stored.identity.jsessionid.as_deref(), Some("LOGINJS"));

        let resp = app
            .clone()
            .oneshot(bearer_get("/ovirt-engine/api", &issued.access_token))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        // Only the handshake reached the backend.
        assert_eq!(server.received_requests().await.unwrap().len(), 2);

        let resp = app
            .clone()
            .oneshot(form_post(
                "/ovirt-engine/sso/oauth/revoke",
                &format!("token={}", issued.access_token),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let revoked: RevokeResponse = json_body(resp).await;
        assert_eq!(revoked.status, "revoked");

        let resp = app
            .oneshot(bearer_get("/ovirt-engine/api", &issued.access_token))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_requested_scope_is_echoed() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        let app = crate::server::app(state_for(&server));

        let resp = app
            .oneshot(form_post(
                "/ovirt-engine/sso/oauth/token",
                "grant_type=password&username=admin&password=pw&scope=ovirt-app-api",
            ))
            .await
            .unwrap();
        let issued: TokenResponse = json_body(resp).await;
        assert_eq!(issued.scope, "ovirt-app-api");
    }

    #[tokio::test]
    async fn test_revoke_requires_token() {
        let server = MockServer::start().await;
        let app = crate::server::app(state_for(&server));
        let resp = app
            .clone()
            .oneshot(form_post("/ovirt-engine/sso/oauth/revoke", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Unknown tokens still report success.
        let resp = app
            .oneshot(form_post("/ovirt-engine/sso/oauth/revoke", "token=unknown"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
