//! Blocking HTTP client for the Oilfox cloud API.
//!
//! - Blocking client using `ureq` (no async).
//! - Two-step exchange per poll: credential login, then one authorised
//!   summary request. No token caching and no retries; every poll logs in
//!   afresh.
//!
//! Endpoint paths, the token field and header differ between the legacy v2
//! API and the customer API; both live in [`ApiProfile`].

use http::StatusCode;
use log::debug;
use serde_json::{Value, json};
use std::time::Duration;

use crate::models::oilfox::SummaryDocument;

pub const DEFAULT_BASE_URL: &str = "https://api.oilfox.io";
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
const USER_AGENT: &str = concat!("oilfox-sync/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug)]
pub enum FetchError {
    /// Rejected credentials or a login answer without a usable token.
    Auth(String),
    /// Connection failure, timeout or unreadable body.
    Transport(String),
    Http { status: u16, body: String },
    /// Body is not valid JSON or not shaped like a summary.
    Parse(String),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Auth(_) => "auth",
            FetchError::Transport(_) => "transport",
            FetchError::Http { .. } => "http",
            FetchError::Parse(_) => "parse",
        }
    }
}

impl core::fmt::Display for FetchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FetchError::Auth(s) => write!(f, "auth error: {}", s),
            FetchError::Transport(s) => write!(f, "transport error: {}", s),
            FetchError::Http { status, body } => write!(f, "http {}: {}", status, body),
            FetchError::Parse(s) => write!(f, "parse error: {}", s),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<serde_json::Error> for FetchError {
    fn from(value: serde_json::Error) -> Self {
        FetchError::Parse(value.to_string())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TokenHeader {
    /// `X-Auth-Token: <token>`
    XAuthToken,
    /// `Authorization: Bearer <token>`
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiProfile {
    pub base_url: String,
    pub login_path: String,
    pub token_field: String,
    pub token_header: TokenHeader,
    pub summary_path: String,
    /// Summary field holding the device records; also the slot prefix.
    pub collection: String,
}

impl ApiProfile {
    pub fn v2() -> Self {
        ApiProfile {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: "/v2/backoffice/session".to_string(),
            token_field: "token".to_string(),
            token_header: TokenHeader::XAuthToken,
            summary_path: "/v2/user/summary".to_string(),
            collection: "devices".to_string(),
        }
    }

    pub fn customer() -> Self {
        ApiProfile {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: "/customer-api/v1/login".to_string(),
            token_field: "access_token".to_string(),
            token_header: TokenHeader::Bearer,
            summary_path: "/customer-api/v1/device".to_string(),
            collection: "items".to_string(),
        }
    }

    pub fn named(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "v2" => Some(Self::v2()),
            "customer" | "v1" => Some(Self::customer()),
            _ => None,
        }
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub struct OilfoxClient {
    agent: ureq::Agent,
    profile: ApiProfile,
    credentials: Credentials,
}

impl OilfoxClient {
    pub fn new(profile: ApiProfile, credentials: Credentials, timeout: Duration) -> Self {
        Self::with_proxy(profile, credentials, timeout, ureq::Proxy::try_from_env())
    }

    fn with_proxy(
        profile: ApiProfile,
        credentials: Credentials,
        timeout: Duration,
        proxy: Option<ureq::Proxy>,
    ) -> Self {
        // Status codes are inspected here rather than surfaced as ureq errors.
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .proxy(proxy)
            .build();
        OilfoxClient {
            agent: ureq::Agent::new_with_config(config),
            profile,
            credentials,
        }
    }

    /// Login, then fetch the summary with the fresh token.
    pub fn fetch_summary(&self) -> Result<SummaryDocument, FetchError> {
        let token = self.login()?;
        self.get_summary(&token)
    }

    pub fn login(&self) -> Result<String, FetchError> {
        let url = self.profile.url(&self.profile.login_path);
        debug!("POST {} (email={})", url, self.credentials.email);
        let body = json!({
            "email": self.credentials.email,
            "password": self.credentials.password,
        });
        let resp = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "*/*")
            .header("User-Agent", USER_AGENT)
            .send_json(&body);
        let (status, text) = read_response("login", &url, resp)?;
        check_status("login", status, &text)?;

        let value: Value = serde_json::from_str(&text)?;
        extract_token(&value, &self.profile.token_field)
    }

    pub fn get_summary(&self, token: &str) -> Result<SummaryDocument, FetchError> {
        let url = self.profile.url(&self.profile.summary_path);
        debug!("GET {}", url);
        let req = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT);
        let req = match self.profile.token_header {
            TokenHeader::XAuthToken => req.header("X-Auth-Token", token),
            TokenHeader::Bearer => req.header("Authorization", &format!("Bearer {}", token)),
        };
        let (status, text) = read_response("summary", &url, req.call())?;
        check_status("summary", status, &text)?;

        let value: Value = serde_json::from_str(&text)?;
        SummaryDocument::from_value(value, &self.profile.collection).map_err(FetchError::Parse)
    }
}

fn read_response(
    step: &str,
    url: &str,
    resp: Result<http::Response<ureq::Body>, ureq::Error>,
) -> Result<(StatusCode, String), FetchError> {
    let mut resp = resp.map_err(|e| FetchError::Transport(format!("{} request to {} failed: {}", step, url, e)))?;
    let status = resp.status();
    let text = resp
        .body_mut()
        .read_to_string()
        .map_err(|e| FetchError::Transport(format!("reading {} response failed: {}", step, e)))?;
    debug!("{} answered {} ({} bytes)", step, status, text.len());
    Ok((status, text))
}

fn check_status(step: &str, status: StatusCode, body: &str) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    let body = truncate(body, MAX_ERROR_BODY);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::Auth(format!(
            "{} rejected with {}: {}",
            step,
            status.as_u16(),
            body
        )));
    }
    Err(FetchError::Http {
        status: status.as_u16(),
        body,
    })
}

fn extract_token(value: &Value, field: &str) -> Result<String, FetchError> {
    match value.get(field) {
        Some(Value::String(t)) if !t.trim().is_empty() => Ok(t.clone()),
        Some(_) => Err(FetchError::Auth(format!("login response field `{}` is not a usable token", field))),
        None => Err(FetchError::Auth(format!("login response has no `{}` field", field))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}

#[cfg(test)]
impl OilfoxClient {
    /// Client aimed at a local mock server, proxy settings ignored.
    pub(crate) fn for_test(base_url: &str, mut profile: ApiProfile, timeout: Duration) -> Self {
        profile.base_url = base_url.to_string();
        OilfoxClient::with_proxy(
            profile,
            Credentials {
                email: "user@example.com".to_string(),
                password: "hunter2".to_string(),
            },
            timeout,
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn v2_exchange_uses_x_auth_token() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(POST)
                .path("/v2/backoffice/session")
                .header("content-type", "application/json")
                .header("accept", "*/*")
                .header("user-agent", USER_AGENT)
                .json_body(json!({"email": "user@example.com", "password": "hunter2"}));
            then.status(200).json_body(json!({"token": "tok-123"}));
        });
        let summary = server.mock(|when, then| {
            when.method(GET)
                .path("/v2/user/summary")
                .header("x-auth-token", "tok-123");
            then.status(200)
                .json_body(json!({"country": "DE", "devices": [{"id": "A", "metering": {"liters": 10}}]}));
        });
        let client = OilfoxClient::for_test(&server.base_url(), ApiProfile::v2(), TIMEOUT);

        let doc = client.fetch_summary().unwrap();
        assert_eq!(doc.collection, "devices");
        assert_eq!(doc.devices.len(), 1);
        login.assert_hits(1);
        summary.assert_hits(1);
    }

    #[test]
    fn customer_profile_uses_bearer_and_items() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/customer-api/v1/login");
            then.status(200)
                .json_body(json!({"access_token": "abc", "refresh_token": "r"}));
        });
        let devices = server.mock(|when, then| {
            when.method(GET)
                .path("/customer-api/v1/device")
                .header("authorization", "Bearer abc");
            then.status(200).json_body(json!({"items": [{"id": 1}, {"id": 2}]}));
        });
        let client = OilfoxClient::for_test(&server.base_url(), ApiProfile::customer(), TIMEOUT);

        let doc = client.fetch_summary().unwrap();
        assert_eq!(doc.collection, "items");
        assert_eq!(doc.devices.len(), 2);
        devices.assert_hits(1);
    }

    #[test]
    fn missing_token_is_auth_error_and_skips_summary() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(POST).path("/v2/backoffice/session");
            then.status(200).json_body(json!({"message": "ok"}));
        });
        let summary = server.mock(|when, then| {
            when.path("/v2/user/summary");
            then.status(200).json_body(json!({}));
        });
        let client = OilfoxClient::for_test(&server.base_url(), ApiProfile::v2(), TIMEOUT);

        let err = client.fetch_summary().unwrap_err();
        assert!(matches!(err, FetchError::Auth(_)), "got {err:?}");
        login.assert_hits(1);
        assert_eq!(summary.hits(), 0);
    }

    #[test]
    fn rejected_credentials_are_auth_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v2/backoffice/session");
            then.status(401).body("bad credentials");
        });
        let client = OilfoxClient::for_test(&server.base_url(), ApiProfile::v2(), TIMEOUT);
        assert!(matches!(client.login(), Err(FetchError::Auth(m)) if m.contains("401")));
    }

    #[test]
    fn server_error_is_http_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v2/backoffice/session");
            then.status(200).json_body(json!({"token": "t"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2/user/summary");
            then.status(503).body("maintenance");
        });
        let client = OilfoxClient::for_test(&server.base_url(), ApiProfile::v2(), TIMEOUT);
        match client.fetch_summary() {
            Err(FetchError::Http { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v2/backoffice/session");
            then.status(200).json_body(json!({"token": "t"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2/user/summary");
            then.status(200)
                .header("content-type", "application/json")
                .body("{\"devices\": [");
        });
        let client = OilfoxClient::for_test(&server.base_url(), ApiProfile::v2(), TIMEOUT);
        assert!(matches!(client.fetch_summary(), Err(FetchError::Parse(_))));
    }

    #[test]
    fn stalled_summary_times_out_as_transport_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v2/backoffice/session");
            then.status(200).json_body(json!({"token": "t"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2/user/summary");
            then.status(200).json_body(json!({})).delay(Duration::from_secs(3));
        });
        let client = OilfoxClient::for_test(&server.base_url(), ApiProfile::v2(), Duration::from_millis(300));
        assert!(matches!(client.fetch_summary(), Err(FetchError::Transport(_))));
    }

    #[test]
    fn unreachable_host_is_transport_error() {
        // Grab a free port, then close it so nothing listens there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = OilfoxClient::for_test(
            &format!("http://127.0.0.1:{}", port),
            ApiProfile::v2(),
            Duration::from_secs(2),
        );
        assert!(matches!(client.login(), Err(FetchError::Transport(_))));
    }
    #[test]
    fn profile_lookup_and_url_joining() {
        assert_eq!(ApiProfile::named("V2"), Some(ApiProfile::v2()));
        assert_eq!(ApiProfile::named("customer").unwrap().collection, "items");
        assert_eq!(ApiProfile::named("v9"), None);

        let mut p = ApiProfile::v2();
        p.base_url = "http://host/".to_string();
        assert_eq!(p.url("/a"), "http://host/a");
        assert_eq!(p.url("b"), "http://host/b");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let c = Credentials {
            email: "me@x".into(),
            password: "secret".into(),
        };
        assert!(!format!("{c:?}").contains("secret"));
    }
}
