//! Command handler functions for the covrelay CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use rusqlite::Connection;

use crate::ingest::{self, CoverageJob, COVERAGE_TASK};
use crate::model::TaskStatus;
use crate::scm::{ScmClient, ScmError, ScmProvider, ScmResult};
use crate::tasks::TaskRegistry;
use crate::{db, parsers, report};

/// Provider for registries that only validate and schedule tasks.
struct EnqueueOnly;

impl ScmProvider for EnqueueOnly {
    fn client_for(&self, _installation_id: Option<&str>) -> ScmResult<Box<dyn ScmClient>> {
        Err(ScmError::Credentials(
            "this registry only schedules tasks".to_string(),
        ))
    }
}

/// A registry with every task type, for scheduling from the command line.
pub fn enqueue_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    ingest::register(&mut registry, Arc::new(EnqueueOnly), String::new());
    registry
}

pub fn cmd_enqueue(conn: &Connection, registry: &TaskRegistry, job: &CoverageJob) -> Result<String> {
    let id = registry.enqueue(conn, COVERAGE_TASK, job)?;
    Ok(format!(
        "Scheduled task {id} ({COVERAGE_TASK}) for {}/{}@{} ({} bytes)\n",
        job.organization,
        job.repo,
        job.commit,
        job.data.len()
    ))
}

pub fn cmd_tasks(conn: &Connection, errors_only: bool) -> Result<String> {
    let status = errors_only.then_some(TaskStatus::Error);
    let tasks = db::list_tasks(conn, status)?;
    if tasks.is_empty() {
        return Ok("No tasks.\n".to_string());
    }

    let mut out = String::new();
    writeln!(out, "{:>6}  {:<16} {:<10} CREATED", "ID", "NAME", "STATUS").unwrap();
    writeln!(out, "{}", "-".repeat(70)).unwrap();
    for task in &tasks {
        writeln!(
            out,
            "{:>6}  {:<16} {:<10} {}",
            task.id,
            task.name,
            task.status.as_str(),
            task.creation_date.format("%Y-%m-%d %H:%M:%S")
        )
        .unwrap();
        if let Some(lease) = task.lease_until {
            writeln!(out, "        leased until {}", lease.format("%Y-%m-%d %H:%M:%S")).unwrap();
        }
        if let Some(info) = &task.info {
            for line in info.lines() {
                writeln!(out, "        {line}").unwrap();
            }
        }
    }
    Ok(out)
}

pub fn cmd_requeue(conn: &Connection, id: i64) -> Result<String> {
    if !db::requeue_task(conn, id)? {
        bail!("No failed task with id {id}");
    }
    Ok(format!("Task {id} scheduled again\n"))
}

pub fn cmd_parse(file: &Path) -> Result<String> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let data = parsers::parse_raw_coverage_data(&bytes)?;
    Ok(report::format_summary(&data))
}

pub fn cmd_report(
    conn: &Connection,
    organization: &str,
    repo: &str,
    commit: &str,
    project: Option<&str>,
) -> Result<String> {
    let Some(summary) = db::get_report(conn, organization, repo, commit, project)? else {
        bail!("No report for {organization}/{repo}@{commit}");
    };
    let files = db::get_report_files(conn, organization, repo, commit, project)?;

    let mut out = String::new();
    writeln!(out, "Branch:     {}", summary.branch).unwrap();
    if let Some(project) = &summary.project {
        writeln!(out, "Project:    {project}").unwrap();
    }
    writeln!(
        out,
        "Lines:      {}/{} ({:.1}%)",
        summary.lines_covered,
        summary.lines_valid,
        summary.line_rate * 100.0
    )
    .unwrap();
    if summary.branches_valid > 0 {
        writeln!(
            out,
            "Branches:   {}/{} ({:.1}%)",
            summary.branches_covered,
            summary.branches_valid,
            summary.branch_rate * 100.0
        )
        .unwrap();
    }
    writeln!(out, "Updated:    {}", summary.modification_date.to_rfc3339()).unwrap();

    out.push('\n');
    writeln!(out, "{:<60} {:>8}", "FILE", "RATE").unwrap();
    writeln!(out, "{}", "-".repeat(69)).unwrap();
    for f in &files {
        writeln!(out, "{:<60} {:>7.1}%", f.filename, f.line_rate * 100.0).unwrap();
    }
    Ok(out)
}

pub fn cmd_report_file(
    conn: &Connection,
    organization: &str,
    repo: &str,
    commit: &str,
    filename: &str,
    project: Option<&str>,
) -> Result<String> {
    let Some(file) = db::get_report_file(conn, organization, repo, commit, filename, project)?
    else {
        return Ok(format!("No coverage data for '{filename}'\n"));
    };

    let mut out = String::new();
    writeln!(out, "{:>6}  {:>10}", "LINE", "HITS").unwrap();
    writeln!(out, "{}", "-".repeat(18)).unwrap();
    for (line, hits) in &file.lines {
        let marker = if *hits > 0 { "✓" } else { "✗" };
        writeln!(out, "{line:>6}  {hits:>10}  {marker}").unwrap();
    }
    Ok(out)
}
