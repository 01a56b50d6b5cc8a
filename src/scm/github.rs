//! GitHub backend: REST API over `ureq`, authenticated with either a static
//! token or GitHub App installation tokens.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::token_cache::TokenCache;
use super::{ScmClient, ScmError, ScmProvider, ScmResult};
use crate::model::Pull;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const CHECK_NAME: &str = "coverage";
const TOKEN_CACHE_CAPACITY: usize = 256;
const JWT_LIFETIME_SECS: i64 = 2 * 60;
/// Largest page size the REST API accepts.
const PAGE_SIZE: usize = 100;

enum Auth {
    Token(String),
    App {
        app_id: String,
        key: EncodingKey,
        default_installation: Option<String>,
        tokens: Mutex<TokenCache>,
    },
}

struct Shared {
    api_url: String,
    agent: ureq::Agent,
    auth: Auth,
}

/// Creates GitHub clients that share one HTTP agent and token cache.
pub struct GitHubProvider {
    shared: Arc<Shared>,
}

impl GitHubProvider {
    /// Authenticate every request with a fixed token (PAT or Actions token).
    pub fn with_token(api_url: &str, token: String, timeout: Duration) -> Self {
        Self::build(api_url, Auth::Token(token), timeout)
    }

    /// Authenticate as a GitHub App using its RSA private key.
    pub fn with_app(
        api_url: &str,
        app_id: String,
        private_key_pem: &[u8],
        default_installation: Option<String>,
        timeout: Duration,
    ) -> ScmResult<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| ScmError::Credentials(format!("invalid app private key: {e}")))?;
        let auth = Auth::App {
            app_id,
            key,
            default_installation,
            tokens: Mutex::new(TokenCache::new(
                TOKEN_CACHE_CAPACITY,
                chrono::Duration::minutes(2),
            )),
        };
        Ok(Self::build(api_url, auth, timeout))
    }

    fn build(api_url: &str, auth: Auth, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent("covrelay")
            .build();
        Self {
            shared: Arc::new(Shared {
                api_url: api_url.trim_end_matches('/').to_string(),
                agent,
                auth,
            }),
        }
    }
}

impl ScmProvider for GitHubProvider {
    fn client_for(&self, installation_id: Option<&str>) -> ScmResult<Box<dyn ScmClient>> {
        Ok(Box::new(GitHubClient {
            shared: Arc::clone(&self.shared),
            installation_id: installation_id.map(str::to_string),
        }))
    }
}

pub struct GitHubClient {
    shared: Arc<Shared>,
    installation_id: Option<String>,
}

#[derive(Serialize)]
struct AppClaims<'a> {
    iat: i64,
    exp: i64,
    iss: &'a str,
}

#[derive(Deserialize)]
struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct GitHubRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Deserialize)]
struct GitHubPull {
    number: u64,
    #[serde(default)]
    state: String,
    base: GitHubRef,
    head: GitHubRef,
}

#[derive(Deserialize)]
struct Created {
    id: u64,
}

/// Map a failed call to the error taxonomy, reading the response body.
fn map_error(err: ureq::Error) -> ScmError {
    match err {
        ureq::Error::Status(status, resp) => {
            let body = resp.into_string().unwrap_or_default();
            match status {
                401 | 403 => ScmError::Unauthorized(body),
                404 => ScmError::NotFound(body),
                _ => ScmError::Api { status, body },
            }
        }
        ureq::Error::Transport(t) => ScmError::Transport(t.to_string()),
    }
}

fn read_error(e: std::io::Error) -> ScmError {
    ScmError::Transport(format!("failed to read response body: {e}"))
}

impl GitHubClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.shared.api_url, path)
    }

    /// Current bearer token, minting an installation token when needed.
    fn token(&self) -> ScmResult<String> {
        match &self.shared.auth {
            Auth::Token(token) => Ok(token.clone()),
            Auth::App {
                app_id,
                key,
                default_installation,
                tokens,
            } => {
                let installation = self
                    .installation_id
                    .as_deref()
                    .or(default_installation.as_deref())
                    .ok_or_else(|| {
                        ScmError::Credentials("no GitHub App installation id".to_string())
                    })?;

                let now = Utc::now();
                let mut cache = tokens
                    .lock()
                    .map_err(|_| ScmError::Credentials("token cache poisoned".to_string()))?;
                if let Some(token) = cache.get(installation, now) {
                    return Ok(token);
                }

                let claims = AppClaims {
                    iat: now.timestamp(),
                    exp: now.timestamp() + JWT_LIFETIME_SECS,
                    iss: app_id,
                };
                let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
                    .map_err(|e| ScmError::Credentials(format!("failed to sign app JWT: {e}")))?;

                debug!(installation, "requesting installation access token");
                let url = self.url(&format!("/app/installations/{installation}/access_tokens"));
                let access: AccessToken = self
                    .shared
                    .agent
                    .post(&url)
                    .set("Authorization", &format!("Bearer {jwt}"))
                    .set("Accept", "application/vnd.github+json")
                    .set("X-GitHub-Api-Version", "2022-11-28")
                    .call()
                    .map_err(map_error)?
                    .into_json()
                    .map_err(read_error)?;

                cache.insert(installation, access.token.clone(), access.expires_at, now);
                Ok(access.token)
            }
        }
    }

    fn request(&self, method: &str, path: &str, accept: &str) -> ScmResult<ureq::Request> {
        let token = self.token()?;
        Ok(self
            .shared
            .agent
            .request(method, &self.url(path))
            .set("Authorization", &format!("Bearer {token}"))
            .set("Accept", accept)
            .set("X-GitHub-Api-Version", "2022-11-28"))
    }
}

impl ScmClient for GitHubClient {
    fn get_pulls(&self, org: &str, repo: &str, commit: &str) -> ScmResult<Vec<Pull>> {
        let path = format!("/repos/{org}/{repo}/commits/{commit}/pulls");
        let mut pulls = Vec::new();
        let mut page = 1u32;
        loop {
            let resp = match self
                .request("GET", &path, "application/vnd.github+json")?
                .query("per_page", &PAGE_SIZE.to_string())
                .query("page", &page.to_string())
                .call()
            {
                Ok(resp) => resp,
                // GitHub answers 422 when the commit has no associated pulls.
                Err(ureq::Error::Status(422, _)) => break,
                Err(e) => return Err(map_error(e)),
            };
            let batch: Vec<GitHubPull> = resp.into_json().map_err(read_error)?;
            let last_page = batch.len() < PAGE_SIZE;
            pulls.extend(
                batch
                    .into_iter()
                    .filter(|p| p.state.is_empty() || p.state == "open")
                    .map(|p| Pull {
                        id: p.number,
                        base: p.base.name,
                        head: p.head.name,
                    }),
            );
            if last_page {
                break;
            }
            page += 1;
        }
        Ok(pulls)
    }

    fn get_pull_diff(&self, org: &str, repo: &str, pull: u64) -> ScmResult<String> {
        let path = format!("/repos/{org}/{repo}/pulls/{pull}");
        self.request("GET", &path, "application/vnd.github.v3.diff")?
            .call()
            .map_err(map_error)?
            .into_string()
            .map_err(read_error)
    }

    fn file_exists(&self, org: &str, repo: &str, commit: &str, path: &str) -> ScmResult<bool> {
        let api_path = format!("/repos/{org}/{repo}/contents/{path}");
        match self
            .request("GET", &api_path, "application/vnd.github+json")?
            .query("ref", commit)
            .call()
        {
            Ok(_) => Ok(true),
            Err(e) => match map_error(e) {
                ScmError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    fn download_file(
        &self,
        org: &str,
        repo: &str,
        commit: &str,
        path: &str,
    ) -> ScmResult<Vec<u8>> {
        let api_path = format!("/repos/{org}/{repo}/contents/{path}");
        let resp = self
            .request("GET", &api_path, "application/vnd.github.v3.raw")?
            .query("ref", commit)
            .call()
            .map_err(map_error)?;
        let mut bytes = Vec::new();
        resp.into_reader()
            .read_to_end(&mut bytes)
            .map_err(read_error)?;
        Ok(bytes)
    }

    fn create_check(&self, org: &str, repo: &str, commit: &str) -> ScmResult<String> {
        let path = format!("/repos/{org}/{repo}/check-runs");
        let created: Created = self
            .request("POST", &path, "application/vnd.github+json")?
            .send_json(serde_json::json!({
                "head_sha": commit,
                "name": CHECK_NAME,
                "status": "in_progress",
            }))
            .map_err(map_error)?
            .into_json()
            .map_err(read_error)?;
        Ok(created.id.to_string())
    }

    fn update_check(
        &self,
        org: &str,
        repo: &str,
        check_id: &str,
        running: bool,
        success: bool,
        text: Option<&str>,
    ) -> ScmResult<()> {
        let path = format!("/repos/{org}/{repo}/check-runs/{check_id}");
        let mut body = if running {
            serde_json::json!({ "status": "in_progress" })
        } else {
            serde_json::json!({
                "status": "completed",
                "conclusion": if success { "success" } else { "failure" },
            })
        };
        if let Some(text) = text {
            body["output"] = serde_json::json!({ "title": CHECK_NAME, "summary": text });
        }
        self.request("PATCH", &path, "application/vnd.github+json")?
            .send_json(body)
            .map_err(map_error)?;
        Ok(())
    }

    fn create_comment(&self, org: &str, repo: &str, pull: u64, body: &str) -> ScmResult<String> {
        let path = format!("/repos/{org}/{repo}/issues/{pull}/comments");
        let created: Created = self
            .request("POST", &path, "application/vnd.github+json")?
            .send_json(serde_json::json!({ "body": body }))
            .map_err(map_error)?
            .into_json()
            .map_err(read_error)?;
        Ok(created.id.to_string())
    }

    fn update_comment(
        &self,
        org: &str,
        repo: &str,
        comment_id: &str,
        body: &str,
    ) -> ScmResult<()> {
        let path = format!("/repos/{org}/{repo}/issues/comments/{comment_id}");
        self.request("PATCH", &path, "application/vnd.github+json")?
            .send_json(serde_json::json!({ "body": body }))
            .map_err(map_error)?;
        Ok(())
    }
}
