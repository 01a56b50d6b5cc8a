use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RelayError, Result};
use crate::model::{
    CoverageData, CoverageReportPullRequest, DiffCoverage, FileCoverageData, FileSummary, Pull,
    ReportSummary, Task, TaskStatus,
};

pub const SCHEMA_VERSION: u32 = 2;

const SCHEMA: &str = include_str!("../schema.sql");

/// Stored in place of a missing project so it can be part of primary keys.
pub const ROOT_PROJECT: &str = "/";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the covrelay database at the given path.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Ensure the schema is initialized. Safe to call on an already-initialized DB.
/// Performs forward migrations when the on-disk schema version is older than
/// `SCHEMA_VERSION`.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(version) if version == SCHEMA_VERSION => {}
        Some(version) if version > SCHEMA_VERSION => {
            return Err(RelayError::Other(format!(
                "Database schema version {version} is newer than this binary supports \
                 ({SCHEMA_VERSION}). Please upgrade covrelay."
            )));
        }
        Some(version) => migrate(conn, version)?,
    }
    Ok(())
}

/// Apply migrations from `from_version` up to `SCHEMA_VERSION`.
///
/// To add a migration, bump `SCHEMA_VERSION`, add an arm `N => ...` that
/// moves version N to N+1, and update schema.sql to the final state.
fn migrate(conn: &Connection, from_version: u32) -> Result<()> {
    let mut current = from_version;
    while current < SCHEMA_VERSION {
        info!(from = current, to = current + 1, "migrating database schema");
        match current {
            1 => conn.execute_batch("ALTER TABLE tasks ADD COLUMN lease_until TEXT;")?,
            _ => {
                return Err(RelayError::Other(format!(
                    "No migration path from schema version {} to {}.",
                    current,
                    current + 1
                )));
            }
        }
        current += 1;
        conn.execute("UPDATE schema_version SET version = ?1", params![current])?;
    }
    Ok(())
}

/// Run `f` inside a savepoint: released when `f` succeeds, rolled back when it
/// fails. Nests inside an open transaction, or starts one when there is none.
pub fn with_savepoint<T, F>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    conn.execute_batch("SAVEPOINT covrelay")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("RELEASE covrelay")?;
            Ok(value)
        }
        Err(err) => {
            conn.execute_batch("ROLLBACK TO covrelay; RELEASE covrelay")?;
            Err(err)
        }
    }
}

/// Identity of one uploaded coverage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportKey<'a> {
    pub organization: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub commit: &'a str,
    pub project: Option<&'a str>,
}

fn project_key(project: Option<&str>) -> &str {
    project.unwrap_or(ROOT_PROJECT)
}

fn project_from_key(stored: String) -> Option<String> {
    if stored == ROOT_PROJECT {
        None
    } else {
        Some(stored)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_timestamp(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })
    })
    .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Persist a parsed upload. The report row is upserted and its file records
/// are replaced as a whole, atomically.
pub fn save_coverage(conn: &Connection, key: &ReportKey, data: &CoverageData) -> Result<()> {
    let now = timestamp(Utc::now());
    let project = project_key(key.project);

    with_savepoint(conn, |conn| {
        conn.execute(
            "INSERT INTO coverage_reports (organization, repo, branch, commit_hash, project,
                 version, timestamp, lines_valid, lines_covered, line_rate,
                 branches_valid, branches_covered, branch_rate, complexity,
                 creation_date, modification_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
             ON CONFLICT(organization, repo, branch, commit_hash, project) DO UPDATE SET
                 version = excluded.version,
                 timestamp = excluded.timestamp,
                 lines_valid = excluded.lines_valid,
                 lines_covered = excluded.lines_covered,
                 line_rate = excluded.line_rate,
                 branches_valid = excluded.branches_valid,
                 branches_covered = excluded.branches_covered,
                 branch_rate = excluded.branch_rate,
                 complexity = excluded.complexity,
                 modification_date = excluded.modification_date",
            params![
                key.organization,
                key.repo,
                key.branch,
                key.commit,
                project,
                data.version,
                data.timestamp,
                data.lines_valid,
                data.lines_covered,
                data.line_rate,
                data.branches_valid,
                data.branches_covered,
                data.branch_rate,
                data.complexity,
                now,
            ],
        )?;

        conn.execute(
            "DELETE FROM coverage_records
             WHERE organization = ?1 AND repo = ?2 AND branch = ?3
               AND commit_hash = ?4 AND project = ?5",
            params![key.organization, key.repo, key.branch, key.commit, project],
        )?;

        let mut stmt = conn.prepare_cached(
            "INSERT INTO coverage_records (organization, repo, branch, commit_hash, project,
                 filename, line_rate, branch_rate, complexity, lines,
                 creation_date, modification_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        )?;
        for (filename, file) in &data.file_coverage {
            stmt.execute(params![
                key.organization,
                key.repo,
                key.branch,
                key.commit,
                project,
                filename,
                file.line_rate,
                file.branch_rate,
                file.complexity,
                serde_json::to_string(&file.lines)?,
                now,
            ])?;
        }
        Ok(())
    })
}

/// Summary of the most recently saved report for a commit.
pub fn get_report(
    conn: &Connection,
    organization: &str,
    repo: &str,
    commit: &str,
    project: Option<&str>,
) -> Result<Option<ReportSummary>> {
    let summary = conn
        .query_row(
            "SELECT organization, repo, branch, commit_hash, project,
                    lines_valid, lines_covered, line_rate,
                    branches_valid, branches_covered, branch_rate, complexity,
                    modification_date
             FROM coverage_reports
             WHERE organization = ?1 AND repo = ?2 AND commit_hash = ?3 AND project = ?4
             ORDER BY modification_date DESC
             LIMIT 1",
            params![organization, repo, commit, project_key(project)],
            |row| {
                Ok(ReportSummary {
                    organization: row.get(0)?,
                    repo: row.get(1)?,
                    branch: row.get(2)?,
                    commit_hash: row.get(3)?,
                    project: project_from_key(row.get(4)?),
                    lines_valid: row.get(5)?,
                    lines_covered: row.get(6)?,
                    line_rate: row.get(7)?,
                    branches_valid: row.get(8)?,
                    branches_covered: row.get(9)?,
                    branch_rate: row.get(10)?,
                    complexity: row.get(11)?,
                    modification_date: parse_timestamp(row, 12)?,
                })
            },
        )
        .optional()?;
    Ok(summary)
}

/// Per-file line rates of a commit's report, ordered by filename.
pub fn get_report_files(
    conn: &Connection,
    organization: &str,
    repo: &str,
    commit: &str,
    project: Option<&str>,
) -> Result<Vec<FileSummary>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT filename, line_rate FROM coverage_records
         WHERE organization = ?1 AND repo = ?2 AND commit_hash = ?3 AND project = ?4
         ORDER BY filename",
    )?;
    let rows = stmt.query_map(
        params![organization, repo, commit, project_key(project)],
        |row| {
            Ok(FileSummary {
                filename: row.get(0)?,
                line_rate: row.get(1)?,
            })
        },
    )?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Line-level detail for one file of a commit's report.
pub fn get_report_file(
    conn: &Connection,
    organization: &str,
    repo: &str,
    commit: &str,
    filename: &str,
    project: Option<&str>,
) -> Result<Option<FileCoverageData>> {
    let file = conn
        .query_row(
            "SELECT line_rate, branch_rate, complexity, lines FROM coverage_records
             WHERE organization = ?1 AND repo = ?2 AND commit_hash = ?3
               AND filename = ?4 AND project = ?5
             ORDER BY modification_date DESC
             LIMIT 1",
            params![organization, repo, commit, filename, project_key(project)],
            |row| {
                Ok(FileCoverageData {
                    line_rate: row.get(0)?,
                    branch_rate: row.get(1)?,
                    complexity: row.get(2)?,
                    lines: parse_json::<BTreeMap<u32, u64>>(row, 3)?,
                })
            },
        )
        .optional()?;
    Ok(file)
}

/// Record the pull request's current base/head.
pub fn upsert_pull(conn: &Connection, organization: &str, repo: &str, pull: &Pull) -> Result<()> {
    let now = timestamp(Utc::now());
    conn.execute(
        "INSERT INTO pull_requests (organization, repo, id, base, head, creation_date, modification_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(organization, repo, id) DO UPDATE SET
             base = excluded.base,
             head = excluded.head,
             modification_date = excluded.modification_date",
        params![organization, repo, pull.id, pull.base, pull.head, now],
    )?;
    Ok(())
}

const COVERAGE_DIFF_COLUMNS: &str = "organization, repo, branch, commit_hash, project, pull,
     pull_diff, check_id, comment_id, line_rate, creation_date, modification_date";

fn coverage_diff_from_row(row: &Row) -> rusqlite::Result<CoverageReportPullRequest> {
    Ok(CoverageReportPullRequest {
        organization: row.get(0)?,
        repo: row.get(1)?,
        branch: row.get(2)?,
        commit_hash: row.get(3)?,
        project: project_from_key(row.get(4)?),
        pull: row.get(5)?,
        pull_diff: parse_json(row, 6)?,
        check_id: row.get(7)?,
        comment_id: row.get(8)?,
        line_rate: row.get(9)?,
        creation_date: parse_timestamp(row, 10)?,
        modification_date: parse_timestamp(row, 11)?,
    })
}

/// Look up the reconciliation record of a pull. With `commit` the match is
/// exact; without it the most recently modified record for the pull wins.
pub fn get_coverage_diff(
    conn: &Connection,
    organization: &str,
    repo: &str,
    branch: &str,
    pull: u64,
    commit: Option<&str>,
    project: Option<&str>,
) -> Result<Option<CoverageReportPullRequest>> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {COVERAGE_DIFF_COLUMNS} FROM coverage_report_pull_requests
                 WHERE organization = ?1 AND repo = ?2 AND branch = ?3
                   AND pull = ?4 AND project = ?5
                   AND (?6 IS NULL OR commit_hash = ?6)
                 ORDER BY modification_date DESC, rowid DESC
                 LIMIT 1"
            ),
            params![organization, repo, branch, pull, project_key(project), commit],
            coverage_diff_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Create the reconciliation record for a commit and pull, recording the
/// pull itself alongside.
pub fn create_coverage_diff(
    conn: &Connection,
    key: &ReportKey,
    pull: &Pull,
    pull_diff: &[DiffCoverage],
    check_id: &str,
    comment_id: &str,
    line_rate: f64,
) -> Result<CoverageReportPullRequest> {
    let now = Utc::now();
    let stamp = timestamp(now);
    with_savepoint(conn, |conn| {
        upsert_pull(conn, key.organization, key.repo, pull)?;
        conn.execute(
            &format!(
                "INSERT INTO coverage_report_pull_requests ({COVERAGE_DIFF_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)"
            ),
            params![
                key.organization,
                key.repo,
                key.branch,
                key.commit,
                project_key(key.project),
                pull.id,
                serde_json::to_string(pull_diff)?,
                check_id,
                comment_id,
                line_rate,
                stamp,
            ],
        )?;
        Ok(())
    })?;

    Ok(CoverageReportPullRequest {
        organization: key.organization.to_string(),
        repo: key.repo.to_string(),
        branch: key.branch.to_string(),
        commit_hash: key.commit.to_string(),
        project: key.project.map(str::to_string),
        pull: pull.id,
        pull_diff: pull_diff.to_vec(),
        check_id: check_id.to_string(),
        comment_id: comment_id.to_string(),
        line_rate,
        creation_date: now,
        modification_date: now,
    })
}

/// Store the mutable fields of an existing record and bump its modification
/// date.
pub fn update_coverage_diff(conn: &Connection, record: &mut CoverageReportPullRequest) -> Result<()> {
    let now = Utc::now();
    let changed = conn.execute(
        "UPDATE coverage_report_pull_requests
         SET pull_diff = ?1, check_id = ?2, comment_id = ?3, line_rate = ?4, modification_date = ?5
         WHERE organization = ?6 AND repo = ?7 AND branch = ?8 AND commit_hash = ?9
           AND project = ?10 AND pull = ?11",
        params![
            serde_json::to_string(&record.pull_diff)?,
            record.check_id,
            record.comment_id,
            record.line_rate,
            timestamp(now),
            record.organization,
            record.repo,
            record.branch,
            record.commit_hash,
            project_key(record.project.as_deref()),
            record.pull,
        ],
    )?;
    if changed == 0 {
        return Err(RelayError::Other(format!(
            "No coverage record for pull {} at {}",
            record.pull, record.commit_hash
        )));
    }
    record.modification_date = now;
    Ok(())
}

const TASK_COLUMNS: &str =
    "id, name, data, status, info, lease_until, creation_date, modification_date";

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        data: row.get(2)?,
        status: status.parse().map_err(|e: RelayError| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        info: row.get(4)?,
        lease_until: parse_optional_timestamp(row, 5)?,
        creation_date: parse_timestamp(row, 6)?,
        modification_date: parse_timestamp(row, 7)?,
    })
}

/// Append a scheduled task. Returns its id.
pub fn add_task(conn: &Connection, name: &str, data: &[u8]) -> Result<i64> {
    let now = timestamp(Utc::now());
    conn.execute(
        "INSERT INTO tasks (name, data, status, creation_date, modification_date)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![name, data, TaskStatus::Scheduled.as_str(), now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Claim the oldest scheduled task that nobody holds, leasing it for
/// `lease`. A single statement, so the write lock is held only for the claim.
///
/// A task whose lease has run out is claimable again: its worker is assumed
/// dead.
pub fn get_task(conn: &Connection, lease: Duration) -> Result<Option<Task>> {
    let now = Utc::now();
    let lease = chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or_else(|| RelayError::Other(format!("task lease of {lease:?} is out of range")))?;
    let now = timestamp(now);

    let task = conn
        .query_row(
            &format!(
                "UPDATE tasks SET lease_until = ?1, modification_date = ?2
                 WHERE id = (
                     SELECT id FROM tasks
                     WHERE status = ?3 AND (lease_until IS NULL OR lease_until < ?2)
                     ORDER BY id
                     LIMIT 1
                 )
                 RETURNING {TASK_COLUMNS}"
            ),
            params![timestamp(lease), now, TaskStatus::Scheduled.as_str()],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

pub fn get_task_by_id(conn: &Connection, id: i64) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

/// Record the outcome of a claimed task and release its lease. Returns false
/// when the claim was lost (the lease expired and another worker took it).
pub fn update_task(conn: &Connection, task: &Task, status: TaskStatus, info: Option<&str>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE tasks SET status = ?1, info = ?2, lease_until = NULL, modification_date = ?3
         WHERE id = ?4 AND lease_until IS ?5",
        params![
            status.as_str(),
            info,
            timestamp(Utc::now()),
            task.id,
            task.lease_until.map(timestamp)
        ],
    )?;
    Ok(changed > 0)
}

/// Delete a claimed task. Returns false when the claim was lost.
pub fn remove_task(conn: &Connection, task: &Task) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM tasks WHERE id = ?1 AND lease_until IS ?2",
        params![task.id, task.lease_until.map(timestamp)],
    )?;
    Ok(changed > 0)
}

/// List tasks oldest first, optionally filtered by status.
pub fn list_tasks(conn: &Connection, status: Option<TaskStatus>) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE ?1 IS NULL OR status = ?1
         ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![status.map(|s| s.as_str())], task_from_row)?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Put a failed task back in the queue. Returns false when no failed task
/// has that id.
pub fn requeue_task(conn: &Connection, id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE tasks SET status = ?1, info = NULL, lease_until = NULL, modification_date = ?2
         WHERE id = ?3 AND status = ?4",
        params![
            TaskStatus::Scheduled.as_str(),
            timestamp(Utc::now()),
            id,
            TaskStatus::Error.as_str()
        ],
    )?;
    Ok(changed > 0)
}
