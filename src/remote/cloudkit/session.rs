//! Persisted iCloud web session.
//!
//! Login (SRP and two-factor) happens elsewhere. This side only loads the
//! cookie jar and session file that login left behind, and checks with
//! `/validate` whether they still work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::remote::RemoteError;
use crate::types::Domain;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub home: &'static str,
    pub setup: &'static str,
}

impl Endpoints {
    pub fn for_domain(domain: Domain) -> Self {
        match domain {
            Domain::Com => Self {
                home: "https://www.icloud.com",
                setup: "https://setup.icloud.com/setup/ws/1",
            },
            Domain::Cn => Self {
                home: "https://www.icloud.com.cn",
                setup: "https://setup.icloud.com.cn/setup/ws/1",
            },
        }
    }
}

/// Keep only word characters, matching the names login tools give the
/// cookie and session files.
pub fn sanitize_username(username: &str) -> String {
    username
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

pub fn cookie_jar_path(cookie_dir: &Path, username: &str) -> PathBuf {
    cookie_dir.join(sanitize_username(username))
}

pub fn session_file_path(cookie_dir: &Path, username: &str) -> PathBuf {
    cookie_dir.join(format!("{}.session", sanitize_username(username)))
}

fn is_cookie_expired(cookie_str: &str, now: &chrono::DateTime<chrono::Utc>) -> bool {
    if let Ok(parsed) = cookie::Cookie::parse(cookie_str) {
        if let Some(expires) = parsed.expires_datetime() {
            let expires_utc =
                chrono::DateTime::<chrono::Utc>::from(std::time::SystemTime::from(expires));
            return expires_utc < *now;
        }
    }
    false
}

#[derive(Deserialize)]
struct CookieEntry {
    url: String,
    cookie: String,
}

/// Parse a cookie jar file into `(url, set-cookie)` pairs, dropping expired
/// cookies. Accepts the JSON array format and the older tab-separated one.
pub fn parse_cookie_jar(contents: &str, now: &chrono::DateTime<chrono::Utc>) -> Vec<(url::Url, String)> {
    let raw: Vec<(String, String)> = match serde_json::from_str::<Vec<CookieEntry>>(contents) {
        Ok(entries) => entries.into_iter().map(|e| (e.url, e.cookie)).collect(),
        Err(_) => contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("Set-Cookie3:"))
            .filter_map(|l| l.split_once('\t'))
            .map(|(u, c)| (u.to_string(), c.to_string()))
            .collect(),
    };
    raw.into_iter()
        .filter(|(url, cookie)| {
            let expired = is_cookie_expired(cookie, now);
            if expired {
                tracing::debug!("Pruning expired cookie from {}", url);
            }
            !expired
        })
        .filter_map(|(url, cookie)| url.parse::<url::Url>().ok().map(|u| (u, cookie)))
        .collect()
}

/// Where the photos database lives for this account, learned from
/// `/validate`.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub ckdatabasews_url: String,
    pub params: HashMap<String, Value>,
}

#[derive(Debug)]
pub enum Validation {
    Valid(ServiceInfo),
    Expired,
    Required,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    #[serde(default)]
    ds_info: Option<DsInfo>,
    #[serde(default)]
    webservices: Option<Webservices>,
}

#[derive(Debug, Deserialize)]
struct DsInfo {
    #[serde(default)]
    dsid: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Webservices {
    #[serde(default)]
    ckdatabasews: Option<WebserviceEndpoint>,
}

#[derive(Debug, Deserialize)]
struct WebserviceEndpoint {
    url: String,
}

pub struct Session {
    client: Client,
    endpoints: Endpoints,
    has_cookies: bool,
    client_id: Option<String>,
}

impl Session {
    /// Load the cookie jar and session file for `username`. Missing files
    /// are not an error: the probe then reports `Required`.
    pub async fn load(cookie_dir: &Path, username: &str, domain: Domain) -> anyhow::Result<Self> {
        let endpoints = Endpoints::for_domain(domain);
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let mut has_cookies = false;

        let jar_path = cookie_jar_path(cookie_dir, username);
        match tokio::fs::read_to_string(&jar_path).await {
            Ok(contents) => {
                let cookies = parse_cookie_jar(&contents, &chrono::Utc::now());
                has_cookies = !cookies.is_empty();
                for (url, cookie) in cookies {
                    jar.add_cookie_str(&cookie, &url);
                }
                tracing::debug!("Read cookies from {}", jar_path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No cookie jar at {}", jar_path.display());
            }
            Err(e) => {
                tracing::warn!("Failed to read cookiejar {}: {}", jar_path.display(), e);
            }
        }

        let session_path = session_file_path(cookie_dir, username);
        let client_id = match tokio::fs::read_to_string(&session_path).await {
            Ok(contents) => serde_json::from_str::<HashMap<String, Value>>(&contents)
                .ok()
                .and_then(|m| m.get("client_id").and_then(Value::as_str).map(str::to_string)),
            Err(_) => None,
        };

        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static(endpoints.home));
        headers.insert(REFERER, HeaderValue::from_str(&format!("{}/", endpoints.home))?);
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        let client = Client::builder()
            .cookie_provider(jar)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoints,
            has_cookies,
            client_id,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// POST `{setup}/validate` with body `null`.
    pub async fn validate(&self) -> Result<Validation, RemoteError> {
        if !self.has_cookies {
            return Ok(Validation::Required);
        }
        let url = format!("{}/validate", self.endpoints.setup);
        tracing::debug!("Checking session token validity");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body("null")
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            401 | 403 | 421 | 450 => return Ok(Validation::Expired),
            s if !(200..300).contains(&s) => return Err(RemoteError::from_status(s, &url)),
            _ => {}
        }

        let data: ValidateResponse = response.json().await?;
        let ckdatabasews_url = data
            .webservices
            .and_then(|ws| ws.ckdatabasews)
            .map(|ep| ep.url)
            .ok_or_else(|| RemoteError::Permanent("validate response has no ckdatabasews URL".into()))?;

        let mut params = HashMap::new();
        params.insert("clientBuildNumber".to_string(), Value::from("2522Project44"));
        params.insert("clientMasteringNumber".to_string(), Value::from("2522B2"));
        params.insert("remapEnums".to_string(), Value::Bool(true));
        params.insert("getCurrentSyncToken".to_string(), Value::Bool(true));
        if let Some(id) = &self.client_id {
            params.insert("clientId".to_string(), Value::from(id.as_str()));
        }
        if let Some(dsid) = data.ds_info.and_then(|d| d.dsid) {
            let dsid = match dsid {
                Value::String(s) => s,
                other => other.to_string(),
            };
            params.insert("dsid".to_string(), Value::String(dsid));
        }

        Ok(Validation::Valid(ServiceInfo {
            ckdatabasews_url,
            params,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_username() {
        assert_eq!(sanitize_username("jane.doe@example.com"), "janedoeexamplecom");
        assert_eq!(sanitize_username("user_1"), "user_1");
    }

    #[test]
    fn test_paths() {
        let dir = Path::new("/cookies");
        assert_eq!(cookie_jar_path(dir, "a@b.c"), PathBuf::from("/cookies/abc"));
        assert_eq!(session_file_path(dir, "a@b.c"), PathBuf::from("/cookies/abc.session"));
    }

    #[test]
    fn test_parse_json_jar_prunes_expired() {
        let now = chrono::Utc::now();
        let json = r#"[
            {"url": "https://www.icloud.com/", "cookie": "X-APPLE-WEBAUTH-TOKEN=abc; Path=/"},
            {"url": "https://www.icloud.com/", "cookie": "old=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT"},
            {"url": "not a url", "cookie": "a=b"}
        ]"#;
        let cookies = parse_cookie_jar(json, &now);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].1.starts_with("X-APPLE-WEBAUTH-TOKEN"));
    }

    #[test]
    fn test_parse_legacy_jar() {
        let now = chrono::Utc::now();
        let legacy = "#LWP-Cookies-2.0\nhttps://www.icloud.com/\ta=1\n\nSet-Cookie3: b=2\n";
        let cookies = parse_cookie_jar(legacy, &now);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].1, "a=1");
    }

    #[tokio::test]
    async fn test_missing_jar_requires_login() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::load(dir.path(), "nobody@example.com", Domain::Com)
            .await
            .unwrap();
        assert!(matches!(session.validate().await.unwrap(), Validation::Required));
    }

    #[test]
    fn test_validate_response_shape() {
        let json = r#"{
            "dsInfo": {"dsid": 12345},
            "webservices": {"ckdatabasews": {"url": "https://p123-ckdatabasews.icloud.com:443"}}
        }"#;
        let resp: ValidateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.ds_info.unwrap().dsid, Some(Value::from(12345)));
        assert_eq!(
            resp.webservices.unwrap().ckdatabasews.unwrap().url,
            "https://p123-ckdatabasews.icloud.com:443"
        );
    }
}
