use std::sync::Arc;

use anyhow::Context as _;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::annotate::PullRequestAnnotator;
use crate::config::{apply_base_path, CoverageConfiguration, CONFIG_FILENAME};
use crate::db::{self, ReportKey};
use crate::error::Result;
use crate::parsers::parse_raw_coverage_data;
use crate::scm::{ScmClient, ScmError, ScmProvider};
use crate::tasks::TaskRegistry;

/// Task name the coverage pipeline is registered under.
pub const COVERAGE_TASK: &str = "coveragereport";

/// An uploaded coverage report waiting to be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageJob {
    pub organization: String,
    pub repo: String,
    pub branch: String,
    pub commit: String,
    #[serde(default)]
    pub project: Option<String>,
    /// SCM credential identity the upload belongs to.
    #[serde(default)]
    pub installation_id: Option<String>,
    /// Raw upload bytes, base64 in the serialized form.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl CoverageJob {
    pub fn key(&self) -> ReportKey<'_> {
        ReportKey {
            organization: &self.organization,
            repo: &self.repo,
            branch: &self.branch,
            commit: &self.commit,
            project: self.project.as_deref(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(de::Error::custom)
    }
}

/// What one ingestion did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub files: usize,
    pub pulls: usize,
}

/// Fetch `cov.yaml` at the commit. A missing or unparsable file is no
/// configuration; credential and transport failures propagate.
pub fn load_config(scm: &dyn ScmClient, job: &CoverageJob) -> Result<Option<CoverageConfiguration>> {
    let (org, repo, commit) = (&job.organization, &job.repo, &job.commit);
    if !scm.file_exists(org, repo, commit, CONFIG_FILENAME)? {
        debug!(commit = %commit, "no {CONFIG_FILENAME} in repository");
        return Ok(None);
    }
    let bytes = match scm.download_file(org, repo, commit, CONFIG_FILENAME) {
        Ok(bytes) => bytes,
        Err(ScmError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(CoverageConfiguration::from_yaml(&String::from_utf8_lossy(&bytes)))
}

/// Process one upload: parse, apply project paths, reconcile the commit's
/// pull requests, persist, then comment and finalize checks.
///
/// Every SCM read happens before the report is stored, so a rejected
/// credential or a vanished pull leaves nothing behind.
pub fn ingest(
    conn: &Connection,
    scm: &dyn ScmClient,
    public_url: &str,
    job: &CoverageJob,
) -> Result<IngestSummary> {
    let mut coverage = parse_raw_coverage_data(&job.data)?;

    let config = load_config(scm, job)?;
    if let Some(base_path) = config
        .as_ref()
        .and_then(|c| c.base_path(job.project.as_deref()))
    {
        debug!(base_path, "prefixing coverage paths");
        apply_base_path(&mut coverage, base_path);
    }

    let key = job.key();
    let annotator = PullRequestAnnotator {
        conn,
        scm,
        public_url,
        key,
        config: config.as_ref(),
    };
    let prepared = annotator.prepare(&coverage)?;

    if let Err(e) = db::save_coverage(conn, &key, &coverage) {
        annotator.abandon(&prepared);
        return Err(e);
    }
    annotator.publish(&prepared, &coverage)?;
    let pulls = prepared.len();

    info!(
        organization = %job.organization,
        repo = %job.repo,
        branch = %job.branch,
        commit = %job.commit,
        files = coverage.file_coverage.len(),
        pulls,
        "ingested coverage"
    );
    Ok(IngestSummary {
        files: coverage.file_coverage.len(),
        pulls,
    })
}

/// Register the coverage pipeline with a task registry.
pub fn register(registry: &mut TaskRegistry, provider: Arc<dyn ScmProvider>, public_url: String) {
    registry.register::<CoverageJob, _>(COVERAGE_TASK, move |conn, job| {
        let scm = provider
            .client_for(job.installation_id.as_deref())
            .context("failed to create SCM client")?;
        ingest(conn, scm.as_ref(), &public_url, &job).with_context(|| {
            format!(
                "failed to ingest {}/{} at {}",
                job.organization, job.repo, job.commit
            )
        })?;
        Ok(())
    });
}
