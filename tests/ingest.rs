mod common;

use std::sync::Arc;

use common::FakeScm;
use covrelay::annotate::ABANDONED_CHECK_TEXT;
use covrelay::db;
use covrelay::ingest::{self, CoverageJob, IngestSummary, COVERAGE_TASK};
use covrelay::model::{Pull, TaskStatus};
use covrelay::tasks::{RunOutcome, TaskRegistry};
use rusqlite::Connection;

const PUBLIC_URL: &str = "https://cov.example.com";

fn job(commit: &str, data: Vec<u8>) -> CoverageJob {
    CoverageJob {
        organization: "org".to_string(),
        repo: "repo".to_string(),
        branch: "feature".to_string(),
        commit: commit.to_string(),
        project: None,
        installation_id: Some("42".to_string()),
        data,
    }
}

/// Manifest lists `a/b.py`; the report names `b.py` under source `/a`.
fn upload(lines: &[(u32, u64)]) -> Vec<u8> {
    common::envelope(
        &["a/b.py"],
        &[("coverage.xml", &common::cobertura("/a", "b.py", lines))],
    )
}

fn record_count(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM coverage_report_pull_requests",
        [],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn queued_upload_is_stored_and_annotated() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 2, 1));

    let mut registry = TaskRegistry::new();
    ingest::register(&mut registry, Arc::new(scm.clone()), PUBLIC_URL.to_string());
    let id = registry
        .enqueue(&conn, COVERAGE_TASK, &job("c1", upload(&[(2, 1)])))
        .unwrap();

    assert_eq!(registry.run_once(&conn).unwrap(), RunOutcome::Completed(id));
    assert!(db::list_tasks(&conn, None).unwrap().is_empty());

    let file = db::get_report_file(&conn, "org", "repo", "c1", "a/b.py", None)
        .unwrap()
        .unwrap();
    assert_eq!(file.lines.into_iter().collect::<Vec<_>>(), vec![(2, 1)]);

    let record = db::get_coverage_diff(&conn, "org", "repo", "feature", 7, Some("c1"), None)
        .unwrap()
        .unwrap();
    assert_eq!(record.comment_id, "comment-1");
    assert_eq!(record.check_id, "check-1");
    assert_eq!(record.line_rate, 1.0);
    assert_eq!(record.pull_diff.len(), 1);
    assert_eq!(record.pull_diff[0].hits, 1);

    let state = scm.state.lock().unwrap();
    assert_eq!(state.installations, vec![Some("42".to_string())]);
    assert_eq!(state.check_updates.len(), 1);
    assert!(state.check_updates[0].success);
    assert!(!state.check_updates[0].running);
    assert_eq!(state.check_updates[0].text, None);

    let body = &state.comments["comment-1"];
    assert!(body.starts_with("## Coverage Report"));
    assert!(body.contains("https://cov.example.com/report/org/repo/feature/c1"));
}

#[test]
fn reupload_of_same_commit_edits_comment() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 2, 1));
    let upload = job("c1", upload(&[(2, 1)]));

    ingest::ingest(&conn, &scm, PUBLIC_URL, &upload).unwrap();
    ingest::ingest(&conn, &scm, PUBLIC_URL, &upload).unwrap();

    {
        let state = scm.state.lock().unwrap();
        assert_eq!(state.created_comments, 1);
        assert_eq!(state.updated_comments, 1);
        assert_eq!(state.created_checks, 2);
    }
    assert_eq!(record_count(&conn), 1);

    let record = db::get_coverage_diff(&conn, "org", "repo", "feature", 7, Some("c1"), None)
        .unwrap()
        .unwrap();
    assert_eq!(record.check_id, "check-2");
    assert_eq!(record.comment_id, "comment-1");
}

#[test]
fn new_commit_on_pull_reuses_comment() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 2, 1));

    ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c1", upload(&[(2, 0)]))).unwrap();
    ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c2", upload(&[(2, 3)]))).unwrap();

    assert_eq!(record_count(&conn), 2);
    let first = db::get_coverage_diff(&conn, "org", "repo", "feature", 7, Some("c1"), None)
        .unwrap()
        .unwrap();
    let second = db::get_coverage_diff(&conn, "org", "repo", "feature", 7, Some("c2"), None)
        .unwrap()
        .unwrap();
    assert_eq!(first.comment_id, second.comment_id);
    assert_eq!(first.line_rate, 0.0);
    assert_eq!(second.line_rate, 1.0);

    let latest = db::get_coverage_diff(&conn, "org", "repo", "feature", 7, None, None)
        .unwrap()
        .unwrap();
    assert_eq!(latest.commit_hash, "c2");

    let state = scm.state.lock().unwrap();
    assert_eq!(state.created_comments, 1);
    assert_eq!(state.updated_comments, 1);
}

#[test]
fn pull_into_reported_branch_is_skipped() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_pull(3, "feature", "topic", &common::added_lines_diff("a/b.py", 2, 1));

    let summary = ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c1", upload(&[(2, 1)]))).unwrap();

    assert_eq!(summary, IngestSummary { files: 1, pulls: 0 });
    assert_eq!(scm.count("get_pull_diff"), 0);
    assert_eq!(scm.count("create_check"), 0);
    assert!(db::get_report(&conn, "org", "repo", "c1", None).unwrap().is_some());
}

#[test]
fn missed_target_fails_check() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new()
        .with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 1, 2))
        .with_file("cov.yaml", "target: \"90%\"\n");

    ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c1", upload(&[(1, 1), (2, 0)]))).unwrap();

    let state = scm.state.lock().unwrap();
    assert_eq!(state.check_updates.len(), 1);
    let update = &state.check_updates[0];
    assert!(!update.success);
    assert_eq!(
        update.text.as_deref(),
        Some("Coverage of 50.0% does not meet target of 90%")
    );
}

#[test]
fn missing_config_passes_check() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 1, 2));

    ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c1", upload(&[(1, 0), (2, 0)]))).unwrap();

    assert_eq!(scm.count("download_file"), 0);
    assert!(scm.state.lock().unwrap().check_updates[0].success);
}

#[test]
fn project_base_path_prefixes_files() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_file("cov.yaml", "projects:\n  ui:\n    base_path: app\n");
    let mut upload_job = job(
        "c1",
        common::envelope(
            &["src/a.py"],
            &[("coverage.xml", &common::cobertura("/work", "src/a.py", &[(1, 1)]))],
        ),
    );
    upload_job.project = Some("ui".to_string());

    ingest::ingest(&conn, &scm, PUBLIC_URL, &upload_job).unwrap();

    assert!(db::get_report_file(&conn, "org", "repo", "c1", "app/src/a.py", Some("ui"))
        .unwrap()
        .is_some());
    assert!(db::get_report_file(&conn, "org", "repo", "c1", "src/a.py", Some("ui"))
        .unwrap()
        .is_none());
    assert!(db::get_report(&conn, "org", "repo", "c1", None).unwrap().is_none());
}

#[test]
fn unparseable_upload_marks_task_failed() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 2, 1));

    let mut registry = TaskRegistry::new();
    ingest::register(&mut registry, Arc::new(scm.clone()), PUBLIC_URL.to_string());
    let id = registry
        .enqueue(&conn, COVERAGE_TASK, &job("c1", b"not an envelope".to_vec()))
        .unwrap();

    assert_eq!(registry.run_once(&conn).unwrap(), RunOutcome::Failed(id));

    let task = db::get_task_by_id(&conn, id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    let info = task.info.unwrap();
    assert!(info.contains("failed to ingest org/repo at c1"), "{info}");
    assert!(info.contains("Could not find coverage file"), "{info}");

    assert!(db::get_report(&conn, "org", "repo", "c1", None).unwrap().is_none());
    assert_eq!(scm.count("create_comment"), 0);
}

#[test]
fn rejected_credentials_leave_nothing_stored() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new()
        .with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 2, 1))
        .with_failure("get_pulls", 401);

    let mut registry = TaskRegistry::new();
    ingest::register(&mut registry, Arc::new(scm.clone()), PUBLIC_URL.to_string());
    let id = registry
        .enqueue(&conn, COVERAGE_TASK, &job("c1", upload(&[(2, 1)])))
        .unwrap();

    assert_eq!(registry.run_once(&conn).unwrap(), RunOutcome::Failed(id));
    let task = db::get_task_by_id(&conn, id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    let info = task.info.unwrap();
    assert!(info.contains("API unauthorized"), "{info}");

    assert!(db::get_report(&conn, "org", "repo", "c1", None).unwrap().is_none());
    assert_eq!(record_count(&conn), 0);
    assert_eq!(scm.count("create_check"), 0);
}

#[test]
fn failed_check_creation_leaves_nothing_stored() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new()
        .with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 2, 1))
        .with_failure("create_check", 404);

    let mut registry = TaskRegistry::new();
    ingest::register(&mut registry, Arc::new(scm.clone()), PUBLIC_URL.to_string());
    let id = registry
        .enqueue(&conn, COVERAGE_TASK, &job("c1", upload(&[(2, 1)])))
        .unwrap();

    assert_eq!(registry.run_once(&conn).unwrap(), RunOutcome::Failed(id));
    let info = db::get_task_by_id(&conn, id).unwrap().unwrap().info.unwrap();
    assert!(info.contains("Not found: create_check"), "{info}");

    assert!(db::get_report(&conn, "org", "repo", "c1", None).unwrap().is_none());
    assert_eq!(record_count(&conn), 0);
    assert_eq!(scm.count("create_comment"), 0);
    assert_eq!(scm.count("update_check"), 0);
}

#[test]
fn checks_opened_before_a_failure_are_closed() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 2, 1));
    // Listed, but its diff can no longer be fetched.
    scm.state.lock().unwrap().pulls.push(Pull {
        id: 8,
        base: "release".to_string(),
        head: "feature".to_string(),
    });

    let err = ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c1", upload(&[(2, 1)]))).unwrap_err();
    assert!(err.to_string().contains("pull 8"), "{err}");

    assert!(db::get_report(&conn, "org", "repo", "c1", None).unwrap().is_none());
    let state = scm.state.lock().unwrap();
    assert_eq!(state.created_comments, 0);
    assert_eq!(state.check_updates.len(), 1);
    let update = &state.check_updates[0];
    assert_eq!(update.check_id, "check-1");
    assert!(!update.running);
    assert!(!update.success);
    assert_eq!(update.text.as_deref(), Some(ABANDONED_CHECK_TEXT));
}

#[test]
fn failed_comment_edit_closes_check() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new().with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 2, 1));
    ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c1", upload(&[(2, 1)]))).unwrap();
    // Someone deleted the comment on the pull.
    scm.state.lock().unwrap().comments.clear();

    assert!(ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c2", upload(&[(2, 1)]))).is_err());

    let state = scm.state.lock().unwrap();
    assert_eq!(state.created_checks, 2);
    let last = state.check_updates.last().unwrap();
    assert_eq!(last.check_id, "check-2");
    assert!(!last.running);
    assert!(!last.success);
    assert_eq!(last.text.as_deref(), Some(ABANDONED_CHECK_TEXT));
    drop(state);
    assert_eq!(record_count(&conn), 1);
}

#[test]
fn malformed_config_passes_check() {
    let (conn, _dir, _) = common::setup_db();
    let scm = FakeScm::new()
        .with_pull(7, "main", "feature", &common::added_lines_diff("a/b.py", 1, 2))
        .with_file("cov.yaml", "target: \"90%\"\nprojects: [unclosed\n");

    ingest::ingest(&conn, &scm, PUBLIC_URL, &job("c1", upload(&[(1, 0), (2, 0)]))).unwrap();

    assert_eq!(scm.count("download_file"), 1);
    let state = scm.state.lock().unwrap();
    assert_eq!(state.check_updates.len(), 1);
    assert!(state.check_updates[0].success);
    assert_eq!(state.check_updates[0].text, None);
}
