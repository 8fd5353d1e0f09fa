//! CloudStack backend client.
//!
//! Executes exactly one backend command per call. The command name decides
//! how the request is authenticated:
//!
//! - `login` sends raw credentials in a form body, unsigned.
//! - `logout` and `getUserKeys` ride on the session cookies
//!   (`JSESSIONID` + `sessionkey`) of the request context, unsigned.
//! - everything else is signed with the identity's `apikey`/`secretkey`.
//!
//! Any `JSESSIONID` the backend sets is written back into the
//! [`RequestContext`].

use reqwest::header::COOKIE;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::auth::BasicCredentials;
use crate::config::BackendConfig;
use crate::context::RequestContext;
use crate::errors::GatewayError;
use crate::metrics::{BACKEND_COMMANDS_TOTAL, BACKEND_COMMAND_DURATION_SECONDS, BACKEND_LOGINS_TOTAL};
use crate::session::BackendIdentity;
use crate::signature::{self, SIGNATURE_PARAM};

pub const LOGIN: &str = "login";
pub const LOGOUT: &str = "logout";
pub const GET_USER_KEYS: &str = "getUserKeys";
pub const QUERY_ASYNC_JOB_RESULT: &str = "queryAsyncJobResult";

/// Parameters the client owns; caller-supplied values for these are dropped.
const RESERVED_PARAMS: &[&str] = &["command", "response", "apikey", SIGNATURE_PARAM];

const SESSION_COOKIE: &str = "JSESSIONID";

/// HTTP method hint for a backend command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// What the call site expects back from a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The response is the final result.
    Immediate,
    /// The backend may answer with an async job handle instead.
    MaybeJob,
}

/// Handle to a backend async job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    /// Id of the object the job acts on, when the backend reports one.
    pub object_id: Option<String>,
}

/// Decoded result of a command whose call site declared an [`Expect`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Completed(Value),
    Job(JobHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Login,
    Logout,
    GetUserKeys,
    Signed,
}

impl CommandKind {
    fn of(command: &str) -> Self {
        match command {
            LOGIN => CommandKind::Login,
            LOGOUT => CommandKind::Logout,
            GET_USER_KEYS => CommandKind::GetUserKeys,
            _ => CommandKind::Signed,
        }
    }

    fn is_identity_command(self) -> bool {
        !matches!(self, CommandKind::Signed)
    }
}

/// HTTP client bound to one CloudStack API endpoint.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    endpoint: String,
}

impl BackendClient {
    /// Create a client for `endpoint`.
    ///
    /// With `verify_tls = false` certificate checks are skipped; the backend
    /// is expected to be an operator-controlled management server.
    pub fn new(endpoint: &str, verify_tls: bool, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        if !verify_tls {
            warn!("TLS certificate verification disabled for backend {}", endpoint);
        }

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.endpoint,
            config.verify_tls,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Execute one backend command with the identity held by `ctx`.
    ///
    /// Returns the parsed JSON body. `logout` without a session returns
    /// `Value::Null` without contacting the backend.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        command: &str,
        params: &[(&str, &str)],
        method: Method,
    ) -> Result<Value, GatewayError> {
        let kind = CommandKind::of(command);

        let mut outgoing: Vec<(String, String)> = vec![
            ("command".to_string(), command.to_string()),
            ("response".to_string(), "json".to_string()),
        ];
        for (k, v) in params {
            if RESERVED_PARAMS.iter().any(|r| k.eq_ignore_ascii_case(r)) {
                debug!("Dropping reserved parameter '{}' for {}", k, command);
                continue;
            }
            outgoing.push((k.to_string(), v.to_string()));
        }

        let mut cookies = None;
        match kind {
            CommandKind::Login => {}
            CommandKind::Logout => match ctx.session_cookies() {
                Some(c) => cookies = Some(c),
                None => {
                    debug!("No backend session to log out; treating as already logged out");
                    return Ok(Value::Null);
                }
            },
            CommandKind::GetUserKeys => {
                cookies = Some(ctx.session_cookies().ok_or(GatewayError::SessionNotFound {
                    gateway_defect: ctx.is_authenticated(),
                })?);
            }
            CommandKind::Signed => {
                let identity = ctx
                    .identity()
                    .filter(BackendIdentity::has_keys)
                    .ok_or(GatewayError::SessionNotFound {
                        gateway_defect: ctx.is_authenticated(),
                    })?;
                outgoing.push(("apikey".to_string(), identity.apikey.clone()));
                let sig = signature::sign(
                    outgoing.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                    &identity.secretkey,
                );
                outgoing.push((SIGNATURE_PARAM.to_string(), sig));
            }
        }

        let use_post = method == Method::Post || kind.is_identity_command();
        let mut request = if use_post {
            self.http.post(&self.endpoint).form(&outgoing)
        } else {
            self.http.get(&self.endpoint).query(&outgoing)
        };
        if let Some((jsessionid, sessionkey)) = cookies {
            let cookie = match jsessionid {
                Some(js) => format!("{SESSION_COOKIE}={js}; sessionkey={sessionkey}"),
                None => format!("sessionkey={sessionkey}"),
            };
            request = request.header(COOKIE, cookie);
        }

        let start = Instant::now();
        let result = self.send(ctx, command, kind, request).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(BACKEND_COMMANDS_TOTAL, "command" => command.to_string(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!(BACKEND_COMMAND_DURATION_SECONDS, "command" => command.to_string())
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        command: &str,
        kind: CommandKind,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, GatewayError> {
        let fail = |message: String| {
            if kind == CommandKind::Login {
                GatewayError::auth("CloudStack authentication failed")
            } else {
                GatewayError::transport(message)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| fail(format!("{command}: {e}")))?;

        if let Some(cookie) = response.cookies().find(|c| c.name() == SESSION_COOKIE) {
            ctx.record_jsessionid(cookie.value());
        }

        let status = response.status();
        if !status.is_success() {
            debug!("Backend {} returned HTTP {}", command, status);
            return Err(fail(format!("{command} returned HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| fail(format!("{command}: invalid JSON response: {e}")))?;

        if kind == CommandKind::Login {
            let login = body.get("loginresponse");
            if login.is_some_and(|l| l.get("errortext").is_some() || l.get("errorcode").is_some())
            {
                return Err(GatewayError::auth("Invalid username or password"));
            }
        }

        Ok(body)
    }

    /// Execute a command whose call site declares up front whether it may
    /// start an async job.
    pub async fn execute_expecting(
        &self,
        ctx: &RequestContext,
        command: &str,
        params: &[(&str, &str)],
        method: Method,
        expect: Expect,
    ) -> Result<CommandOutcome, GatewayError> {
        let body = self.execute(ctx, command, params, method).await?;
        Ok(decode_outcome(command, body, expect))
    }

    /// Run the `login` + `getUserKeys` handshake and return the complete
    /// identity. The identity is also attached to `ctx`.
    ///
    /// Every failure maps to [`GatewayError::Authentication`].
    pub async fn establish_session(
        &self,
        ctx: &RequestContext,
        creds: &BasicCredentials,
    ) -> Result<BackendIdentity, GatewayError> {
        let result = self.handshake(ctx, creds).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(BACKEND_LOGINS_TOTAL, "outcome" => outcome).increment(1);
        result.map_err(|e| match e {
            GatewayError::Authentication { .. } => e,
            other => {
                warn!("Session establishment failed: {}", other);
                GatewayError::auth("CloudStack authentication failed")
            }
        })
    }

    async fn handshake(
        &self,
        ctx: &RequestContext,
        creds: &BasicCredentials,
    ) -> Result<BackendIdentity, GatewayError> {
        let body = self
            .execute(
                ctx,
                LOGIN,
                &[
                    ("username", creds.username.as_str()),
                    ("password", creds.password.as_str()),
                    ("domain", creds.domain.as_str()),
                ],
                Method::Post,
            )
            .await?;

        let login = &body["loginresponse"];
        let sessionkey = json_str(login, "sessionkey");
        let userid = json_str(login, "userid");
        let (Some(sessionkey), Some(userid)) = (sessionkey, userid) else {
            warn!("Login response for {} missing sessionkey/userid", creds.username);
            return Err(GatewayError::auth("Login failed: incomplete response"));
        };

        let mut identity = BackendIdentity {
            userid: userid.clone(),
            account: json_str(login, "account").unwrap_or_default(),
            username: json_str(login, "username").unwrap_or_else(|| creds.username.clone()),
            sessionkey: sessionkey.clone(),
            jsessionid: ctx.captured_jsessionid(),
            ..Default::default()
        };
        ctx.set_identity(identity.clone());

        let keys_body = self
            .execute(
                ctx,
                GET_USER_KEYS,
                &[("id", userid.as_str()), ("sessionkey", sessionkey.as_str())],
                Method::Post,
            )
            .await?;

        let keys = &keys_body["getuserkeysresponse"]["userkeys"];
        let (Some(apikey), Some(secretkey)) = (json_str(keys, "apikey"), json_str(keys, "secretkey"))
        else {
            warn!("No API keys returned for user {}", creds.username);
            return Err(GatewayError::auth("Failed to retrieve user API keys"));
        };

        identity.apikey = apikey;
        identity.secretkey = secretkey;
        identity.jsessionid = ctx.captured_jsessionid().or(identity.jsessionid);
        ctx.set_identity(identity.clone());

        info!(
            "Established CloudStack session for {} (account {})",
            identity.username, identity.account
        );
        Ok(identity)
    }
}

/// Decode a raw command response into the variant its call site expects.
///
/// Only `Expect::MaybeJob` looks for a `jobid`, and only one level down:
/// in `<command>response`, or failing that any object-valued field.
pub fn decode_outcome(command: &str, body: Value, expect: Expect) -> CommandOutcome {
    if expect == Expect::Immediate {
        return CommandOutcome::Completed(body);
    }

    let response_key = format!("{}response", command.to_lowercase());
    let has_job = |v: &&Value| v.is_object() && json_str(v, "jobid").is_some();
    let nested = body.get(&response_key).filter(has_job).or_else(|| {
        body.as_object()
            .and_then(|m| m.values().find(|v| has_job(v)))
    });

    if let Some(job_id) = nested.and_then(|n| json_str(n, "jobid")) {
        return CommandOutcome::Job(JobHandle {
            job_id,
            object_id: nested.and_then(|n| json_str(n, "id")),
        });
    }
    CommandOutcome::Completed(body)
}

/// Read a string field, accepting numbers as well since some CloudStack
/// versions emit ids unquoted.
pub(crate) fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::AuthScheme;
    use crate::fingerprint::Fingerprinter;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    pub(crate) fn client_for(server: &MockServer) -> BackendClient {
        BackendClient::new(
            &format!("{}/client/api", server.uri()),
            true,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    pub(crate) fn keyed_identity() -> BackendIdentity {
        BackendIdentity {
            userid: "u-1".into(),
            account: "admin".into(),
            username: "admin".into(),
            apikey: "API".into(),
            secretkey: "SECRET".into(),
            sessionkey: "SK".into(),
            jsessionid: Some("JS".into()),
        }
    }

    fn creds() -> BasicCredentials {
        BasicCredentials {
            username: "admin".into(),
            domain: "ROOT".into(),
            password: "p@ss word".into(),
        }
    }

    fn query_pairs(req: &Request) -> Vec<(String, String)> {
        req.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[tokio::test]
    async fn test_signed_get_carries_valid_signature() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("command", "listZones"))
            .and(query_param("apikey", "API"))
            .and(query_param("response", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"listzonesresponse": {"count": 0}})))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = RequestContext::anonymous();
        ctx.set_identity(keyed_identity());
        let body = client_for(&server)
            .execute(&ctx, "listZones", &[("available", "true")], Method::Get)
            .await
            .unwrap();
        assert_eq!(body["listzonesresponse"]["count"], 0);

        let requests = server.received_requests().await.unwrap();
        let pairs = query_pairs(&requests[0]);
        let sent_sig = pairs
            .iter()
            .find(|(k, _)| k == "signature")
            .map(|(_, v)| v.clone())
            .unwrap();
        let recomputed = signature::sign(
            pairs
                .iter()
                .filter(|(k, _)| k != "signature")
                .map(|(k, v)| (k.as_str(), v.as_str())),
            "SECRET",
        );
        assert_eq!(sent_sig, recomputed);
        assert!(requests[0].headers.get("cookie").is_none());
    }

    #[tokio::test]
    async fn test_post_hint_uses_form_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=deployVirtualMachine"))
            .and(body_string_contains("signature="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = RequestContext::anonymous();
        ctx.set_identity(keyed_identity());
        client_for(&server)
            .execute(&ctx, "deployVirtualMachine", &[("zoneid", "z")], Method::Post)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reserved_params_cannot_be_overridden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let ctx = RequestContext::anonymous();
        ctx.set_identity(keyed_identity());
        client_for(&server)
            .execute(
                &ctx,
                "listZones",
                &[("apikey", "EVIL"), ("response", "xml"), ("signature", "x")],
                Method::Get,
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let pairs = query_pairs(&requests[0]);
        assert_eq!(pairs.iter().filter(|(k, _)| k == "apikey").count(), 1);
        assert!(pairs.contains(&("apikey".to_string(), "API".to_string())));
        assert!(pairs.contains(&("response".to_string(), "json".to_string())));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "signature").count(), 1);
    }

    #[tokio::test]
    async fn test_signed_command_without_identity() {
        let server = MockServer::start().await;
        let client = client_for(&server);

        let err = client
            .execute(&RequestContext::anonymous(), "listZones", &[], Method::Get)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::SessionNotFound {
                gateway_defect: false
            }
        ));

        let fp = Fingerprinter::new("s").fingerprint("x");
        let ctx = RequestContext::authenticated(fp, AuthScheme::Basic);
        let err = client
            .execute(&ctx, "listZones", &[], Method::Get)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::SessionNotFound {
                gateway_defect: true
            }
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_2xx_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(431).set_body_json(json!({"errorcode": 431})))
            .mount(&server)
            .await;

        let ctx = RequestContext::anonymous();
        ctx.set_identity(keyed_identity());
        let err = client_for(&server)
            .execute(&ctx, "listZones", &[], Method::Get)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DownstreamTransport { .. }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let ctx = RequestContext::anonymous();
        ctx.set_identity(keyed_identity());
        let err = client_for(&server)
            .execute(&ctx, "listZones", &[], Method::Get)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DownstreamTransport { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let client =
            BackendClient::new("http://127.0.0.1:1/client/api", true, Duration::from_secs(2))
                .unwrap();
        let ctx = RequestContext::anonymous();
        ctx.set_identity(keyed_identity());
        let err = client
            .execute(&ctx, "listZones", &[], Method::Get)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DownstreamTransport { .. }));
    }

    #[tokio::test]
    async fn test_login_is_unsigned_post_and_captures_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=login"))
            .and(body_string_contains("username=admin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "JSESSIONID=NEWJS; Path=/client; HttpOnly")
                    .set_body_json(json!({"loginresponse": {"sessionkey": "SK", "userid": "u-1"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ctx = RequestContext::anonymous();
        client_for(&server)
            .execute(
                &ctx,
                LOGIN,
                &[("username", "admin"), ("password", "pw"), ("domain", "")],
                Method::Get,
            )
            .await
            .unwrap();
        assert_eq!(ctx.captured_jsessionid().as_deref(), Some("NEWJS"));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(!body.contains("signature="));
        assert!(!body.contains("apikey="));
    }

    #[tokio::test]
    async fn test_login_error_body_on_200_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"loginresponse": {"errorcode": 531, "errortext": "Unable to log in"}}),
            ))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .execute(&RequestContext::anonymous(), LOGIN, &[], Method::Post)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_login_non_2xx_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(531))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .execute(&RequestContext::anonymous(), LOGIN, &[], Method::Post)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_logout_without_session_skips_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let body = client_for(&server)
            .execute(&RequestContext::anonymous(), LOGOUT, &[], Method::Post)
            .await
            .unwrap();
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn test_logout_sends_session_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=logout"))
            .and(header("cookie", "JSESSIONID=JS; sessionkey=SK"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"logoutresponse": {"description": "success"}})))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = RequestContext::anonymous();
        ctx.set_identity(keyed_identity());
        client_for(&server)
            .execute(&ctx, LOGOUT, &[], Method::Get)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_user_keys_requires_session() {
        let server = MockServer::start().await;
        let err = client_for(&server)
            .execute(&RequestContext::anonymous(), GET_USER_KEYS, &[("id", "u")], Method::Get)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound { .. }));
    }

    pub(crate) async fn mount_handshake(server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_string_contains("command=login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(50))
                    .insert_header("set-cookie", "JSESSIONID=LOGINJS; Path=/client")
                    .set_body_json(json!({"loginresponse": {
                        "sessionkey": "SK", "userid": "u-1", "account": "admin", "username": "admin"
                    }})),
            )
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=getUserKeys"))
            .and(body_string_contains("id=u-1"))
            .and(header("cookie", "JSESSIONID=LOGINJS; sessionkey=SK"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "getuserkeysresponse": {"userkeys": {"apikey": "API", "secretkey": "SECRET"}}
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_establish_session_merges_login_cookie() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;

        let ctx = RequestContext::anonymous();
        let identity = client_for(&server)
            .establish_session(&ctx, &creds())
            .await
            .unwrap();

        assert_eq!(identity.apikey, "API");
        assert_eq!(identity.secretkey, "SECRET");
        assert_eq!(identity.sessionkey, "SK");
        assert_eq!(identity.userid, "u-1");
        assert_eq!(identity.jsessionid.as_deref(), Some("LOGINJS"));
        assert_eq!(ctx.identity(), Some(identity));
    }

    #[tokio::test]
    async fn test_establish_session_missing_sessionkey_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"loginresponse": {"userid": "u-1"}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=getUserKeys"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .establish_session(&RequestContext::anonymous(), &creds())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_establish_session_key_failure_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"loginresponse": {"sessionkey": "SK", "userid": "u-1"}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=getUserKeys"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .establish_session(&RequestContext::anonymous(), &creds())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }

    #[test]
    fn test_decode_outcome_job() {
        let body = json!({"deployvirtualmachineresponse": {"id": "vm-1", "jobid": "7"}});
        assert_eq!(
            decode_outcome("deployVirtualMachine", body, Expect::MaybeJob),
            CommandOutcome::Job(JobHandle {
                job_id: "7".into(),
                object_id: Some("vm-1".into())
            })
        );
    }

    #[test]
    fn test_decode_outcome_immediate_never_probes() {
        let body = json!({"deployvirtualmachineresponse": {"jobid": "7"}});
        assert!(matches!(
            decode_outcome("deployVirtualMachine", body, Expect::Immediate),
            CommandOutcome::Completed(_)
        ));
    }

    #[test]
    fn test_decode_outcome_without_jobid_is_completed() {
        let body = json!({"listzonesresponse": {"count": 1, "zone": [{"id": "z"}]}});
        assert!(matches!(
            decode_outcome("listZones", body, Expect::MaybeJob),
            CommandOutcome::Completed(_)
        ));
    }

    #[test]
    fn test_decode_outcome_falls_back_to_first_object() {
        // Some commands answer under a response key that does not match
        // the command name.
        let body = json!({"startvirtualmachineresponse": {"jobid": 9}});
        assert_eq!(
            decode_outcome("startVM", body, Expect::MaybeJob),
            CommandOutcome::Job(JobHandle {
                job_id: "9".into(),
                object_id: None
            })
        );
    }

    #[test]
    fn test_decode_outcome_scans_every_nested_object() {
        let body = json!({
            "aaa": {"count": 1},
            "startvirtualmachineresponse2": {"id": "vm-2", "jobid": "11"}
        });
        assert_eq!(
            decode_outcome("startVirtualMachine", body, Expect::MaybeJob),
            CommandOutcome::Job(JobHandle {
                job_id: "11".into(),
                object_id: Some("vm-2".into()),
            })
        );
    }

    #[test]
    fn test_decode_outcome_ignores_deeper_jobids() {
        let body = json!({"listresponse": {"items": [{"jobid": "1"}]}});
        assert!(matches!(
            decode_outcome("list", body, Expect::MaybeJob),
            CommandOutcome::Completed(_)
        ));
    }
}
