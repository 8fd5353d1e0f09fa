//! stackgate library: an oVirt-compatible REST gateway for Apache CloudStack.
//!
//! This crate bridges façade credentials (HTTP Basic or OAuth bearer tokens)
//! onto CloudStack's signed-request protocol, caches the resulting backend
//! sessions, and tracks backend async jobs to completion.

use std::sync::Arc;
use tracing::warn;

pub mod auth;
pub mod backend;
pub mod config;
pub mod context;
pub mod errors;
pub mod extract;
pub mod fingerprint;
pub mod jobs;
pub mod metrics;
pub mod oauth;
pub mod server;
pub mod session;
pub mod signature;
pub mod xml;

use crate::backend::BackendClient;
use crate::config::Config;
use crate::fingerprint::Fingerprinter;
use crate::jobs::JobWaiter;
use crate::session::{CredentialStore, TokenStore};

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Client for the CloudStack API.
    pub backend: BackendClient,
    /// Basic-auth fingerprint → backend session.
    pub sessions: Arc<CredentialStore>,
    /// Bearer token fingerprint → backend identity.
    pub tokens: Arc<TokenStore>,
    /// Keyed digest applied to every raw credential.
    pub fingerprinter: Fingerprinter,
    /// Async job polling policy.
    pub jobs: JobWaiter,
}

impl AppState {
    /// Build the state from configuration.
    ///
    /// An empty `security.hmac_secret` gets a random per-process secret.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let fingerprinter = if config.security.hmac_secret.is_empty() {
            warn!("security.hmac_secret is empty; using a random per-process secret");
            Fingerprinter::random()
        } else {
            Fingerprinter::new(&config.security.hmac_secret)
        };

        Ok(Self {
            backend: BackendClient::from_config(&config.backend)?,
            sessions: Arc::new(CredentialStore::new(config.sessions.ttl())),
            tokens: Arc::new(TokenStore::new()),
            fingerprinter,
            jobs: JobWaiter::from_config(&config.jobs),
            config,
        })
    }
}
