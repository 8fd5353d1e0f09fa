//! Handler-facing access to the backend.
//!
//! Resource handlers take a [`BackendSession`] argument and call the
//! backend with the identity the auth middleware resolved for them.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde_json::Value;
use std::sync::Arc;

use crate::backend::{CommandOutcome, Expect, Method};
use crate::context::RequestContext;
use crate::errors::GatewayError;
use crate::session::BackendIdentity;
use crate::AppState;

/// The per-request backend handle.
///
/// Extraction fails with a gateway-defect `SessionNotFound` when the auth
/// middleware did not run for the route.
#[derive(Clone)]
pub struct BackendSession {
    state: Arc<AppState>,
    ctx: Arc<RequestContext>,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for BackendSession {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let ctx = parts
            .extensions
            .get::<Arc<RequestContext>>()
            .cloned()
            .ok_or(GatewayError::SessionNotFound {
                gateway_defect: true,
            })?;
        Ok(Self {
            state: state.clone(),
            ctx,
        })
    }
}

impl BackendSession {
    pub fn identity(&self) -> Option<BackendIdentity> {
        self.ctx.identity()
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub async fn execute(
        &self,
        command: &str,
        params: &[(&str, &str)],
        method: Method,
    ) -> Result<Value, GatewayError> {
        self.state
            .backend
            .execute(&self.ctx, command, params, method)
            .await
    }

    pub async fn execute_expecting(
        &self,
        command: &str,
        params: &[(&str, &str)],
        method: Method,
        expect: Expect,
    ) -> Result<CommandOutcome, GatewayError> {
        self.state
            .backend
            .execute_expecting(&self.ctx, command, params, method, expect)
            .await
    }

    pub async fn wait_for_job(&self, job_id: &str) -> Result<Value, GatewayError> {
        self.state
            .jobs
            .wait(&self.state.backend, &self.ctx, job_id)
            .await
    }

    /// Execute a command that may start an async job and wait for it.
    pub async fn execute_and_wait(
        &self,
        command: &str,
        params: &[(&str, &str)],
        method: Method,
    ) -> Result<Value, GatewayError> {
        let outcome = self
            .execute_expecting(command, params, method, Expect::MaybeJob)
            .await?;
        self.state
            .jobs
            .resolve(&self.state.backend, &self.ctx, outcome)
            .await
    }
}
