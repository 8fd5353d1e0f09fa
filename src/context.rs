//! Per-request identity context.
//!
//! The auth middleware inserts an `Arc<RequestContext>` into the request
//! extensions. The backend client reads the identity from it and writes
//! session-cookie updates back, so a later call in the same request (for
//! example `getUserKeys` right after `login`) sees the new cookie.

use std::sync::Mutex;

use crate::fingerprint::Fingerprint;
use crate::session::BackendIdentity;

/// Which Authorization scheme the caller used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
}

#[derive(Debug, Default)]
pub struct RequestContext {
    auth: Option<(Fingerprint, AuthScheme)>,
    identity: Mutex<Option<BackendIdentity>>,
    jsessionid: Mutex<Option<String>>,
}

impl RequestContext {
    /// Context for a caller that presented credentials.
    pub fn authenticated(fingerprint: Fingerprint, scheme: AuthScheme) -> Self {
        Self {
            auth: Some((fingerprint, scheme)),
            ..Self::default()
        }
    }

    /// Context for gateway-internal calls with no inbound credentials
    /// (e.g. the OAuth token endpoint running a login handshake).
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.auth.as_ref().map(|(fp, _)| fp)
    }

    pub fn scheme(&self) -> Option<AuthScheme> {
        self.auth.as_ref().map(|(_, scheme)| *scheme)
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    pub fn identity(&self) -> Option<BackendIdentity> {
        self.identity
            .lock()
            .expect("request identity mutex poisoned")
            .clone()
    }

    /// Attach a resolved identity. A cookie captured earlier in this request
    /// takes precedence over the one the identity was stored with.
    pub fn set_identity(&self, mut identity: BackendIdentity) {
        if let Some(js) = self.captured_jsessionid() {
            identity.jsessionid = Some(js);
        }
        *self.identity.lock().expect("request identity mutex poisoned") = Some(identity);
    }

    /// Record a `JSESSIONID` the backend just handed out.
    pub fn record_jsessionid(&self, value: &str) {
        *self.jsessionid.lock().expect("jsessionid mutex poisoned") = Some(value.to_string());
        if let Some(identity) = self
            .identity
            .lock()
            .expect("request identity mutex poisoned")
            .as_mut()
        {
            identity.jsessionid = Some(value.to_string());
        }
    }

    /// The `JSESSIONID` captured from a backend response during this request.
    pub fn captured_jsessionid(&self) -> Option<String> {
        self.jsessionid
            .lock()
            .expect("jsessionid mutex poisoned")
            .clone()
    }

    /// `(JSESSIONID, sessionkey)` to present on cookie-authenticated commands.
    /// `None` when the request holds no backend session.
    pub fn session_cookies(&self) -> Option<(Option<String>, String)> {
        let identity = self.identity()?;
        if identity.sessionkey.is_empty() {
            return None;
        }
        let js = self.captured_jsessionid().or(identity.jsessionid);
        Some((js, identity.sessionkey))
    }
}
