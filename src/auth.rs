//! Inbound authentication for the façade API.
//!
//! Callers authenticate with either HTTP Basic (`user[@domain]:password`)
//! or a bearer token issued by the OAuth endpoint. The middleware turns
//! that into a [`RequestContext`] holding a complete [`BackendIdentity`],
//! establishing a CloudStack session on the first Basic request for a
//! credential and reusing it afterwards.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::Response,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::context::{AuthScheme, RequestContext};
use crate::errors::GatewayError;
use crate::fingerprint::Fingerprint;
use crate::metrics::{SESSIONS_ACTIVE, SESSION_CACHE_TOTAL};
use crate::session::{BackendIdentity, CredentialStore, SessionRecord};
use crate::AppState;

/// Paths that bypass authentication regardless of the configured prefixes.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/metrics", "/openapi.json"];

// ── Parsed types ────────────────────────────────────────────────────

/// Credentials from a Basic header or the OAuth password grant.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    /// Empty when the caller gave no `@domain`.
    pub domain: String,
    pub password: String,
}

impl BasicCredentials {
    /// Split a `user[@domain]` login name and a password.
    pub fn new(login: &str, password: &str) -> Self {
        let (username, domain) = login.split_once('@').unwrap_or((login, ""));
        Self {
            username: username.to_string(),
            domain: domain.to_string(),
            password: password.to_string(),
        }
    }

    /// Parse a decoded `user[@domain]:password` string.
    pub fn parse(decoded: &str) -> Result<Self, GatewayError> {
        let (login, password) = decoded
            .split_once(':')
            .ok_or_else(|| GatewayError::auth("Malformed Basic credentials"))?;
        Ok(Self::new(login, password))
    }
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A parsed `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic {
        /// The decoded `user[@domain]:password` string; this is what gets
        /// fingerprinted.
        raw: String,
        credentials: BasicCredentials,
    },
    Bearer(String),
}

impl Credentials {
    pub fn scheme(&self) -> AuthScheme {
        match self {
            Credentials::Basic { .. } => AuthScheme::Basic,
            Credentials::Bearer(_) => AuthScheme::Bearer,
        }
    }

    /// The raw secret value the fingerprint is computed over.
    pub fn raw(&self) -> &str {
        match self {
            Credentials::Basic { raw, .. } => raw,
            Credentials::Bearer(token) => token,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { credentials, .. } => {
                f.debug_tuple("Basic").field(credentials).finish()
            }
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

// ── Header parsing ──────────────────────────────────────────────────

/// Parse an `Authorization` header value.
///
/// The scheme name is case-insensitive. Anything other than `Basic` or
/// `Bearer` is rejected.
pub fn parse_authorization(header: &str) -> Result<Credentials, GatewayError> {
    let (scheme, value) = header
        .trim()
        .split_once(' ')
        .ok_or_else(|| GatewayError::auth("Malformed Authorization header"))?;
    let value = value.trim();

    if scheme.eq_ignore_ascii_case("basic") {
        let bytes = BASE64_STANDARD
            .decode(value)
            .map_err(|_| GatewayError::auth("Invalid Basic credentials encoding"))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| GatewayError::auth("Basic credentials are not valid UTF-8"))?;
        let credentials = BasicCredentials::parse(&raw)?;
        Ok(Credentials::Basic { raw, credentials })
    } else if scheme.eq_ignore_ascii_case("bearer") {
        if value.is_empty() {
            return Err(GatewayError::auth("Empty bearer token"));
        }
        Ok(Credentials::Bearer(value.to_string()))
    } else {
        Err(GatewayError::auth(format!(
            "Unsupported authorization scheme: {scheme}"
        )))
    }
}

// ── Path classification ─────────────────────────────────────────────

/// Whether `path` is served without an Authorization header.
pub fn bypasses_auth(server: &ServerConfig, path: &str) -> bool {
    AUTH_SKIP_PATHS.contains(&path)
        || path.starts_with(&format!("{}/", server.services_path.trim_end_matches('/')))
        || path == server.oauth_token_path()
        || path == server.oauth_revoke_path()
}

// ── Session resolution ──────────────────────────────────────────────

/// Holds the cold-start lock for one fingerprint and releases the lock
/// map entry when dropped, including when the request is cancelled.
struct EstablishTicket<'a> {
    store: &'a CredentialStore,
    key: &'a Fingerprint,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<'a> EstablishTicket<'a> {
    async fn acquire(store: &'a CredentialStore, key: &'a Fingerprint) -> EstablishTicket<'a> {
        let guard = store.establish_lock(key).await;
        Self {
            store,
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for EstablishTicket<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.store.release_establish_lock(self.key);
    }
}

/// Resolve the backend identity for a fingerprinted caller.
///
/// Basic credentials fall back to the login handshake on a cache miss;
/// bearer tokens must already be in the token store.
pub async fn resolve_identity(
    state: &AppState,
    ctx: &RequestContext,
    credentials: &Credentials,
) -> Result<BackendIdentity, GatewayError> {
    let fingerprint = ctx
        .fingerprint()
        .ok_or(GatewayError::SessionNotFound {
            gateway_defect: true,
        })?;

    match credentials {
        Credentials::Bearer(_) => match state.tokens.get(fingerprint) {
            Some(token) => {
                debug!("Bearer token {} resolved", fingerprint);
                metrics::counter!(SESSION_CACHE_TOTAL, "scheme" => "bearer", "result" => "hit")
                    .increment(1);
                Ok(token.identity)
            }
            None => {
                warn!("Rejected unknown or expired bearer token {}", fingerprint);
                metrics::counter!(SESSION_CACHE_TOTAL, "scheme" => "bearer", "result" => "miss")
                    .increment(1);
                Err(GatewayError::auth("Invalid or expired access token"))
            }
        },
        Credentials::Basic { credentials, .. } => {
            if let Some(record) = state.sessions.get(fingerprint) {
                debug!("Session cache hit for {}", fingerprint);
                metrics::counter!(SESSION_CACHE_TOTAL, "scheme" => "basic", "result" => "hit")
                    .increment(1);
                return Ok(record.identity);
            }
            metrics::counter!(SESSION_CACHE_TOTAL, "scheme" => "basic", "result" => "miss")
                .increment(1);

            let _ticket = EstablishTicket::acquire(&state.sessions, fingerprint).await;
            if let Some(record) = state.sessions.get(fingerprint) {
                debug!("Session for {} established by a concurrent request", fingerprint);
                return Ok(record.identity);
            }

            debug!("Establishing backend session for {}", fingerprint);
            let identity = state
                .backend
                .establish_session(ctx, credentials)
                .await
                .inspect_err(|e| warn!("Login failed for {}: {}", fingerprint, e))?;
            state
                .sessions
                .put(fingerprint.clone(), SessionRecord::new(identity.clone()));
            metrics::gauge!(SESSIONS_ACTIVE).set(state.sessions.len() as f64);
            Ok(identity)
        }
    }
}

// ── Middleware ──────────────────────────────────────────────────────

/// Authentication middleware.
///
/// Attaches an `Arc<RequestContext>` to the request extensions. On the
/// logout path the context carries only the fingerprint; the logout
/// handler decides what to tear down.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = req.uri().path().to_string();

    if bypasses_auth(&state.config.server, &path) {
        return Ok(next.run(req).await);
    }

    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let credentials = match header {
        Some(value) => parse_authorization(value).inspect_err(|e| {
            warn!("Rejected Authorization header on {}: {}", path, e);
        })?,
        None => {
            debug!("Missing Authorization header on {}", path);
            return Err(GatewayError::auth("Authorization header required"));
        }
    };

    let fingerprint = state.fingerprinter.fingerprint(credentials.raw());
    let ctx = Arc::new(RequestContext::authenticated(
        fingerprint,
        credentials.scheme(),
    ));

    if path != state.config.server.logout_path() {
        let identity = resolve_identity(&state, &ctx, &credentials).await?;
        ctx.set_identity(identity);
    }

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}
