//! Text rendered for pull request comments, check outputs and the CLI.

use std::fmt::Write;

use crate::model::{CoverageData, DiffCoverage};

/// Everything a pull request coverage comment shows.
pub struct CoverageComment<'a> {
    pub public_url: &'a str,
    pub organization: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub commit: &'a str,
    pub project: Option<&'a str>,
    pub pull: u64,
    /// Overall line rate of the upload (0.0 to 1.0).
    pub line_rate: f64,
    /// Line rate of the lines the pull adds (0.0 to 1.0).
    pub diff_line_rate: f64,
    pub diff: &'a [DiffCoverage],
}

impl CoverageComment<'_> {
    pub fn report_url(&self) -> String {
        format!(
            "{}/report/{}/{}/{}/{}",
            self.public_url.trim_end_matches('/'),
            self.organization,
            self.repo,
            self.branch,
            self.commit
        )
    }

    pub fn diff_report_url(&self) -> String {
        format!("{}/{}", self.report_url(), self.pull)
    }

    /// Render the markdown comment body. Same inputs, same text.
    #[must_use]
    pub fn render(&self) -> String {
        let hits: u64 = self.diff.iter().map(|d| d.hits).sum();
        let misses: u64 = self.diff.iter().map(|d| d.misses).sum();
        let overall = self.line_rate * 100.0;
        let diff_pct = self.diff_line_rate * 100.0;

        let mut md = String::new();
        match self.project {
            Some(project) => writeln!(md, "## Coverage Report ({project})\n").unwrap(),
            None => writeln!(md, "## Coverage Report\n").unwrap(),
        }
        writeln!(md, "Overall coverage: *{overall:.1}%*").unwrap();
        writeln!(md, "Coverage report: {}\n", self.report_url()).unwrap();

        md.push_str("```diff\n");
        md.push_str("@@           Coverage Diff            @@\n");
        md.push_str("========================================\n");
        writeln!(md, "- Coverage    {diff_pct:.1}%").unwrap();
        md.push_str("========================================\n");
        writeln!(md, "+ Hits        {hits}").unwrap();
        writeln!(md, "- Misses      {misses}").unwrap();
        md.push_str("```\n");
        writeln!(md, "Diff coverage report: {}", self.diff_report_url()).unwrap();

        md
    }
}

/// Check output text for a rate that missed its target.
pub fn missed_target(label: &str, rate: f64, target: &str) -> String {
    let pct = rate * 100.0;
    format!("{label} of {pct:.1}% does not meet target of {target}")
}

/// Plain text summary of a parsed upload.
pub fn format_summary(data: &CoverageData) -> String {
    let mut out = String::new();
    let pct = data.line_rate * 100.0;
    let covered = data.lines_covered;
    let total = data.lines_valid;
    writeln!(out, "Line coverage: {pct:.1}% ({covered}/{total} lines covered)").unwrap();
    if data.branches_valid > 0 {
        let pct = data.branch_rate * 100.0;
        let covered = data.branches_covered;
        let total = data.branches_valid;
        writeln!(out, "Branch coverage: {pct:.1}% ({covered}/{total} branches covered)").unwrap();
    }

    if data.file_coverage.is_empty() {
        out.push_str("\nNo files matched the manifest.\n");
        return out;
    }

    out.push('\n');
    let width = data
        .file_coverage
        .keys()
        .map(|p| p.len())
        .max()
        .unwrap_or(4)
        .max(4);
    writeln!(out, "{:<width$}  {:>6}  {:>6}", "File", "Lines", "Rate").unwrap();
    for (path, file) in &data.file_coverage {
        let pct = file.line_rate * 100.0;
        let lines = file.lines.len();
        writeln!(out, "{path:<width$}  {lines:>6}  {pct:>5.1}%").unwrap();
    }
    out
}
