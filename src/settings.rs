//! Process settings, read from flags or the environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::Args;

use crate::scm::github::{GitHubProvider, DEFAULT_API_URL};
use crate::scm::ScmProvider;

/// Source-control credentials.
#[derive(Debug, Clone, Args)]
pub struct ScmSettings {
    /// Static GitHub token (personal access or Actions token).
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// GitHub App id, used with --github-app-pem-file.
    #[arg(long, env = "COVRELAY_GITHUB_APP_ID")]
    pub github_app_id: Option<String>,

    /// GitHub App private key (PEM).
    #[arg(long, env = "COVRELAY_GITHUB_APP_PEM_FILE")]
    pub github_app_pem_file: Option<PathBuf>,

    /// Installation used for jobs that do not name one.
    #[arg(long, env = "COVRELAY_GITHUB_INSTALLATION_ID")]
    pub github_installation_id: Option<String>,

    #[arg(long, env = "COVRELAY_GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub github_api_url: String,

    /// Per-request timeout for SCM calls.
    #[arg(long, env = "COVRELAY_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,
}

impl ScmSettings {
    /// Build the GitHub provider. App credentials win over a static token.
    pub fn provider(&self) -> Result<Arc<dyn ScmProvider>> {
        let timeout = Duration::from_secs(self.http_timeout_secs);
        match (&self.github_app_id, &self.github_app_pem_file, &self.github_token) {
            (Some(app_id), Some(pem_file), _) => {
                let pem = std::fs::read(pem_file).with_context(|| {
                    format!("Failed to read GitHub App key {}", pem_file.display())
                })?;
                let provider = GitHubProvider::with_app(
                    &self.github_api_url,
                    app_id.clone(),
                    &pem,
                    self.github_installation_id.clone(),
                    timeout,
                )?;
                Ok(Arc::new(provider))
            }
            (Some(_), None, _) => bail!("--github-app-id requires --github-app-pem-file"),
            (None, _, Some(token)) => Ok(Arc::new(GitHubProvider::with_token(
                &self.github_api_url,
                token.clone(),
                timeout,
            ))),
            (None, _, None) => {
                bail!("No SCM credentials: set --github-token or --github-app-id with --github-app-pem-file")
            }
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct WorkerSettings {
    #[command(flatten)]
    pub scm: ScmSettings,

    /// Base URL for report links in pull request comments.
    #[arg(long, env = "COVRELAY_PUBLIC_URL", default_value = "http://localhost:8000")]
    pub public_url: String,

    /// Idle wait between queue polls.
    #[arg(long, env = "COVRELAY_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// How long a claimed task is reserved before another worker may retry it.
    /// Must exceed the longest expected job.
    #[arg(long, env = "COVRELAY_TASK_LEASE_SECS", default_value_t = 900)]
    pub lease_secs: u64,

    /// On SIGINT or SIGTERM, how long to wait for the running task.
    #[arg(long, env = "COVRELAY_STOP_GRACE_SECS", default_value_t = 5)]
    pub stop_grace_secs: u64,

    /// Drain the queue once and exit instead of polling.
    #[arg(long)]
    pub once: bool,
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        worker: WorkerSettings,
    }

    #[test]
    fn test_defaults() {
        let cli = TestCli::try_parse_from(["covrelay", "--github-token", "t"]).unwrap();
        let settings = cli.worker;
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.scm.http_timeout_secs, 30);
        assert_eq!(settings.lease(), Duration::from_secs(900));
        assert_eq!(settings.stop_grace(), Duration::from_secs(5));
        assert!(!settings.once);
        assert!(settings.scm.provider().is_ok());
    }

    #[test]
    fn test_flags() {
        let cli = TestCli::try_parse_from([
            "covrelay",
            "--github-token",
            "t",
            "--poll-interval-ms",
            "50",
            "--public-url",
            "https://cov.example.com",
            "--lease-secs",
            "60",
            "--stop-grace-secs",
            "0",
            "--once",
        ])
        .unwrap();
        assert_eq!(cli.worker.lease(), Duration::from_secs(60));
        assert_eq!(cli.worker.stop_grace(), Duration::ZERO);
        assert_eq!(cli.worker.poll_interval(), Duration::from_millis(50));
        assert_eq!(cli.worker.public_url, "https://cov.example.com");
        assert!(cli.worker.once);
    }

    #[test]
    fn test_app_id_requires_key() {
        let settings = ScmSettings {
            github_token: None,
            github_app_id: Some("1".to_string()),
            github_app_pem_file: None,
            github_installation_id: None,
            github_api_url: DEFAULT_API_URL.to_string(),
            http_timeout_secs: 1,
        };
        assert!(settings.provider().is_err());
    }

    #[test]
    fn test_missing_key_file() {
        let settings = ScmSettings {
            github_token: None,
            github_app_id: Some("1".to_string()),
            github_app_pem_file: Some(PathBuf::from("/nonexistent/key.pem")),
            github_installation_id: None,
            github_api_url: DEFAULT_API_URL.to_string(),
            http_timeout_secs: 1,
        };
        assert!(settings.provider().is_err());
    }
}
