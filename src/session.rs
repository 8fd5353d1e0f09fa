//! Backend session and bearer token stores.
//!
//! [`CredentialStore`] caches the CloudStack session established for a
//! Basic-auth fingerprint. [`TokenStore`] holds the identities behind
//! bearer tokens issued by the OAuth endpoint. Both are keyed by
//! [`Fingerprint`] and live for the process lifetime only.
//!
//! Expiry is enforced twice: every lookup treats an expired entry as
//! absent (and drops it), and [`spawn_sweeper`] periodically purges
//! whatever nobody looked up.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::fingerprint::Fingerprint;
use crate::metrics::{SESSIONS_ACTIVE, TOKENS_ACTIVE};

// ── Identity types ──────────────────────────────────────────────────

/// A CloudStack user as seen after login + key retrieval.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BackendIdentity {
    /// CloudStack user UUID.
    pub userid: String,
    /// Account the user belongs to.
    pub account: String,
    /// Login name as supplied by the client (without the domain).
    pub username: String,
    /// Permanent API key used for signed commands.
    pub apikey: String,
    /// Secret matching `apikey`.
    pub secretkey: String,
    /// Short-lived session key returned by `login`.
    pub sessionkey: String,
    /// `JSESSIONID` cookie captured from the login response, if any.
    pub jsessionid: Option<String>,
}

impl BackendIdentity {
    /// Whether this identity can sign commands.
    pub fn has_keys(&self) -> bool {
        !self.apikey.is_empty() && !self.secretkey.is_empty()
    }
}

impl fmt::Debug for BackendIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendIdentity")
            .field("userid", &self.userid)
            .field("account", &self.account)
            .field("username", &self.username)
            .field("apikey", &self.apikey)
            .field("secretkey", &"<redacted>")
            .field("sessionkey", &"<redacted>")
            .field("jsessionid", &self.jsessionid.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A cached, backend-authenticated session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub identity: BackendIdentity,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(identity: BackendIdentity) -> Self {
        Self {
            identity,
            created_at: Utc::now(),
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// The identity behind an issued bearer token.
///
/// The raw token is handed to the client once and only its fingerprint
/// is kept as the store key.
#[derive(Debug, Clone)]
pub struct BearerToken {
    pub identity: BackendIdentity,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BearerToken {
    /// Create a token record valid for `lifetime` from now.
    pub fn new(identity: BackendIdentity, lifetime: Duration) -> Self {
        let issued_at = Utc::now();
        let lifetime = chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::MAX);
        Self {
            identity,
            issued_at,
            expires_at: issued_at.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Seconds until expiry, clamped at zero.
    pub fn expires_in(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u64
    }
}

// ── CredentialStore ─────────────────────────────────────────────────

type EstablishLock = Arc<tokio::sync::Mutex<()>>;

/// Fingerprint → backend session cache.
///
/// A missing key is not an error: it is the signal to run the login
/// handshake. Concurrent first-time callers for the same fingerprint
/// serialize on [`CredentialStore::establish_lock`].
pub struct CredentialStore {
    entries: RwLock<HashMap<Fingerprint, SessionRecord>>,
    ttl: Option<Duration>,
    establishing: Mutex<HashMap<Fingerprint, EstablishLock>>,
}

impl CredentialStore {
    /// Build a store whose records expire `ttl` after creation. `None`
    /// keeps records until they are deleted explicitly.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            establishing: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Look up a live session. Expired records are removed and reported
    /// as absent.
    pub fn get(&self, key: &Fingerprint) -> Option<SessionRecord> {
        let now = Utc::now();
        {
            let entries = self.entries.read().expect("session store rwlock poisoned");
            match entries.get(key) {
                None => return None,
                Some(record) if !self.is_expired(record, now) => return Some(record.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().expect("session store rwlock poisoned");
        // Another request may have replaced it between the two locks.
        if let Some(record) = entries.get(key) {
            if !self.is_expired(record, now) {
                return Some(record.clone());
            }
            entries.remove(key);
            debug!("Session {} expired on lookup", key);
        }
        None
    }

    pub fn put(&self, key: Fingerprint, record: SessionRecord) {
        let mut entries = self.entries.write().expect("session store rwlock poisoned");
        entries.insert(key, record);
    }

    pub fn delete(&self, key: &Fingerprint) -> Option<SessionRecord> {
        let mut entries = self.entries.write().expect("session store rwlock poisoned");
        entries.remove(key)
    }

    /// Remove every record older than `max_age`. Returns how many were removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().expect("session store rwlock poisoned");
        let before = entries.len();
        entries.retain(|_, record| record.age(now) <= max_age);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("session store rwlock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the cold-start lock for `key`.
    ///
    /// Holders must re-check the cache after acquiring, then call
    /// [`CredentialStore::release_establish_lock`] once the guard is dropped.
    pub async fn establish_lock(&self, key: &Fingerprint) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .establishing
                .lock()
                .expect("establish lock map poisoned");
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for `key` if no request is holding or waiting on it.
    pub fn release_establish_lock(&self, key: &Fingerprint) {
        let mut locks = self
            .establishing
            .lock()
            .expect("establish lock map poisoned");
        if let Some(lock) = locks.get(key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }

    fn is_expired(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => record.age(now) > ttl,
            None => false,
        }
    }

    #[cfg(test)]
    fn pending_establish_locks(&self) -> usize {
        self.establishing.lock().unwrap().len()
    }
}

// ── TokenStore ──────────────────────────────────────────────────────

/// Fingerprint(token) → bearer identity registry.
#[derive(Default)]
pub struct TokenStore {
    entries: RwLock<HashMap<Fingerprint, BearerToken>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a token. An expired token is removed and reported as absent.
    pub fn get(&self, key: &Fingerprint) -> Option<BearerToken> {
        let now = Utc::now();
        {
            let entries = self.entries.read().expect("token store rwlock poisoned");
            match entries.get(key) {
                None => return None,
                Some(token) if !token.is_expired_at(now) => return Some(token.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().expect("token store rwlock poisoned");
        if entries.get(key).is_some_and(|t| t.is_expired_at(now)) {
            entries.remove(key);
            debug!("Token {} expired on lookup", key);
        }
        None
    }

    pub fn put(&self, key: Fingerprint, token: BearerToken) {
        let mut entries = self.entries.write().expect("token store rwlock poisoned");
        entries.insert(key, token);
    }

    pub fn delete(&self, key: &Fingerprint) -> Option<BearerToken> {
        let mut entries = self.entries.write().expect("token store rwlock poisoned");
        entries.remove(key)
    }

    /// Remove every token issued more than `max_age` ago.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().expect("token store rwlock poisoned");
        let before = entries.len();
        entries.retain(|_, token| (now - token.issued_at).to_std().unwrap_or_default() <= max_age);
        before - entries.len()
    }

    /// Remove every token past its expiry.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().expect("token store rwlock poisoned");
        let before = entries.len();
        entries.retain(|_, token| !token.is_expired_at(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("token store rwlock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Sweeper ─────────────────────────────────────────────────────────

/// Run one sweep over both stores. Returns `(sessions, tokens)` removed.
pub fn sweep_once(sessions: &CredentialStore, tokens: &TokenStore) -> (usize, usize) {
    let swept_sessions = sessions.ttl().map_or(0, |ttl| sessions.sweep(ttl));
    let swept_tokens = tokens.sweep_expired();

    metrics::gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
    metrics::gauge!(TOKENS_ACTIVE).set(tokens.len() as f64);

    (swept_sessions, swept_tokens)
}

/// Spawn a task that sweeps both stores every `interval`.
pub fn spawn_sweeper(
    sessions: Arc<CredentialStore>,
    tokens: Arc<TokenStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; nothing is stale yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (s, t) = sweep_once(&sessions, &tokens);
            if s > 0 || t > 0 {
                debug!("Swept {} expired sessions and {} expired tokens", s, t);
            }
        }
    })
}
