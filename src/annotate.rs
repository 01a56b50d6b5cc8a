//! Per-pull-request annotation: diff coverage, one check run per pass, and a
//! single comment per pull that is edited in place across re-uploads.
//!
//! Annotation runs in two phases around storing the report. `prepare` does
//! the reads and opens the checks; `publish` writes comments and records.
//! A check that was opened is always finalized, as a failure if the pass
//! errors out.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::{hits_target_coverage, CoverageConfiguration};
use crate::db::{self, ReportKey};
use crate::diff::parse_diff;
use crate::error::Result;
use crate::model::{CoverageData, DiffCoverage, Pull};
use crate::reconcile::get_line_rate;
use crate::report::{missed_target, CoverageComment};
use crate::scm::ScmClient;

/// Outcome of comparing rates against the configured targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub success: bool,
    /// Why the check failed; `None` on success.
    pub text: Option<String>,
}

/// Evaluate the overall target first; the diff target only matters when the
/// overall one passes.
pub fn evaluate_targets(
    config: Option<&CoverageConfiguration>,
    project: Option<&str>,
    line_rate: f64,
    diff_line_rate: f64,
) -> Verdict {
    let Some(config) = config else {
        return Verdict {
            success: true,
            text: None,
        };
    };

    let target = config.target(project);
    if !hits_target_coverage(target, line_rate) {
        return Verdict {
            success: false,
            text: target.map(|t| missed_target("Coverage", line_rate, t)),
        };
    }

    let diff_target = config.diff_target(project);
    if !hits_target_coverage(diff_target, diff_line_rate) {
        return Verdict {
            success: false,
            text: diff_target.map(|t| missed_target("Diff coverage", diff_line_rate, t)),
        };
    }

    Verdict {
        success: true,
        text: None,
    }
}

/// Summary on checks left behind by a failed pass.
pub const ABANDONED_CHECK_TEXT: &str = "Coverage processing failed before the report was complete";

/// A pull reconciled against the upload, with its check opened.
#[derive(Debug, Clone)]
pub struct PreparedPull {
    pub pull: Pull,
    pub diff: Vec<DiffCoverage>,
    pub diff_line_rate: f64,
    pub check_id: String,
}

pub struct PullRequestAnnotator<'a> {
    pub conn: &'a Connection,
    pub scm: &'a dyn ScmClient,
    pub public_url: &'a str,
    pub key: ReportKey<'a>,
    pub config: Option<&'a CoverageConfiguration>,
}

impl PullRequestAnnotator<'_> {
    /// Reconcile every pull request the commit belongs to, except pulls that
    /// merge into the reported branch itself, and open a check on each.
    pub fn prepare(&self, coverage: &CoverageData) -> Result<Vec<PreparedPull>> {
        let key = &self.key;
        let pulls = self.scm.get_pulls(key.organization, key.repo, key.commit)?;
        let mut prepared = Vec::new();
        for pull in pulls {
            if pull.base == key.branch {
                debug!(pull = pull.id, branch = key.branch, "skipping pull into reported branch");
                continue;
            }
            match self.prepare_pull(pull, coverage) {
                Ok(ready) => prepared.push(ready),
                Err(e) => {
                    self.abandon(&prepared);
                    return Err(e);
                }
            }
        }
        Ok(prepared)
    }

    fn prepare_pull(&self, pull: Pull, coverage: &CoverageData) -> Result<PreparedPull> {
        let key = &self.key;
        let diff_text = self.scm.get_pull_diff(key.organization, key.repo, pull.id)?;
        let (diff, diff_line_rate) = get_line_rate(&parse_diff(&diff_text), coverage);
        let check_id = self.scm.create_check(key.organization, key.repo, key.commit)?;
        Ok(PreparedPull {
            pull,
            diff,
            diff_line_rate,
            check_id,
        })
    }

    /// Comment on, record, and finalize the check of every prepared pull.
    /// On error the checks not yet finalized are closed as failed.
    pub fn publish(&self, prepared: &[PreparedPull], coverage: &CoverageData) -> Result<()> {
        for (i, ready) in prepared.iter().enumerate() {
            if let Err(e) = self.publish_pull(ready, coverage) {
                self.abandon(&prepared[i..]);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close the checks of a pass that will not complete. Best effort: the
    /// original error matters more than a failure here.
    pub fn abandon(&self, prepared: &[PreparedPull]) {
        let key = &self.key;
        for ready in prepared {
            if let Err(e) = self.scm.update_check(
                key.organization,
                key.repo,
                &ready.check_id,
                false,
                false,
                Some(ABANDONED_CHECK_TEXT),
            ) {
                warn!(pull = ready.pull.id, check_id = %ready.check_id, error = %e, "could not close check");
            }
        }
    }

    /// Comment created or edited, record stored, check finalized.
    fn publish_pull(&self, ready: &PreparedPull, coverage: &CoverageData) -> Result<()> {
        let key = &self.key;
        let org = key.organization;
        let repo = key.repo;
        let pull = &ready.pull;

        let body = CoverageComment {
            public_url: self.public_url,
            organization: org,
            repo,
            branch: key.branch,
            commit: key.commit,
            project: key.project,
            pull: pull.id,
            line_rate: coverage.line_rate,
            diff_line_rate: ready.diff_line_rate,
            diff: &ready.diff,
        }
        .render();

        let existing = db::get_coverage_diff(
            self.conn,
            org,
            repo,
            key.branch,
            pull.id,
            Some(key.commit),
            key.project,
        )?;
        match existing {
            Some(mut record) => {
                debug!(pull = pull.id, comment_id = %record.comment_id, "re-upload of reconciled commit");
                self.scm
                    .update_comment(org, repo, &record.comment_id, &body)?;
                record.pull_diff = ready.diff.clone();
                record.line_rate = ready.diff_line_rate;
                record.check_id = ready.check_id.clone();
                db::upsert_pull(self.conn, org, repo, pull)?;
                db::update_coverage_diff(self.conn, &mut record)?;
            }
            None => {
                let previous = db::get_coverage_diff(
                    self.conn, org, repo, key.branch, pull.id, None, key.project,
                )?;
                let comment_id = match previous {
                    Some(previous) => {
                        self.scm
                            .update_comment(org, repo, &previous.comment_id, &body)?;
                        previous.comment_id
                    }
                    None => self.scm.create_comment(org, repo, pull.id, &body)?,
                };
                db::create_coverage_diff(
                    self.conn,
                    key,
                    pull,
                    &ready.diff,
                    &ready.check_id,
                    &comment_id,
                    ready.diff_line_rate,
                )?;
            }
        }

        let verdict = evaluate_targets(
            self.config,
            key.project,
            coverage.line_rate,
            ready.diff_line_rate,
        );
        self.scm.update_check(
            org,
            repo,
            &ready.check_id,
            false,
            verdict.success,
            verdict.text.as_deref(),
        )?;

        info!(
            pull = pull.id,
            commit = key.commit,
            diff_line_rate = ready.diff_line_rate,
            success = verdict.success,
            "annotated pull request"
        );
        Ok(())
    }
}
