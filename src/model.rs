//! In-memory representation of an ingested coverage upload and the records
//! derived from it. Parsers produce a `CoverageData`, the diff parser produces
//! `DiffCoverage` entries, and the store persists both.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Compute a coverage rate, returning 1.0 when there is nothing to cover.
#[must_use]
pub fn rate(covered: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        covered as f64 / total as f64
    }
}

/// Coverage data for a single source file, keyed by its manifest path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileCoverageData {
    pub line_rate: f64,
    pub branch_rate: f64,
    pub complexity: f64,
    /// 1-based line number -> hit count.
    pub lines: BTreeMap<u32, u64>,
}

/// The complete result of parsing one coverage upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageData {
    pub version: String,
    /// Epoch milliseconds as reported by the coverage tool.
    pub timestamp: i64,
    pub lines_valid: u64,
    pub lines_covered: u64,
    pub line_rate: f64,
    pub branches_valid: u64,
    pub branches_covered: u64,
    pub branch_rate: f64,
    pub complexity: f64,
    pub file_coverage: BTreeMap<String, FileCoverageData>,
}

impl CoverageData {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Added lines of one file in a pull request diff, plus the hit/miss
/// counts filled in by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffCoverage {
    pub filename: String,
    pub lines: Vec<u32>,
    pub line_rate: f64,
    pub hits: u64,
    pub misses: u64,
}

impl DiffCoverage {
    pub fn new(filename: String, lines: Vec<u32>) -> Self {
        Self {
            filename,
            lines,
            line_rate: 0.0,
            hits: 0,
            misses: 0,
        }
    }
}

/// A pull request as reported by the SCM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pull {
    pub id: u64,
    pub base: String,
    pub head: String,
}

/// Persisted outcome of reconciling one commit against one pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReportPullRequest {
    pub organization: String,
    pub repo: String,
    pub branch: String,
    pub commit_hash: String,
    pub project: Option<String>,
    pub pull: u64,
    pub pull_diff: Vec<DiffCoverage>,
    pub check_id: String,
    pub comment_id: String,
    pub line_rate: f64,
    pub creation_date: DateTime<Utc>,
    pub modification_date: DateTime<Utc>,
}

/// Stored summary of a saved coverage upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSummary {
    pub organization: String,
    pub repo: String,
    pub branch: String,
    pub commit_hash: String,
    pub project: Option<String>,
    pub lines_valid: u64,
    pub lines_covered: u64,
    pub line_rate: f64,
    pub branches_valid: u64,
    pub branches_covered: u64,
    pub branch_rate: f64,
    pub complexity: f64,
    pub modification_date: DateTime<Utc>,
}

/// Per-file summary row of a saved report.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSummary {
    pub filename: String,
    pub line_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Scheduled,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "error" => Ok(TaskStatus::Error),
            other => Err(crate::error::RelayError::Other(format!(
                "Unknown task status: '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable queue record.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub data: Vec<u8>,
    pub status: TaskStatus,
    /// Diagnostic text, set only when `status` is `Error`.
    pub info: Option<String>,
    /// End of the current claim, if a worker holds the task.
    pub lease_until: Option<DateTime<Utc>>,
    pub creation_date: DateTime<Utc>,
    pub modification_date: DateTime<Utc>,
}
