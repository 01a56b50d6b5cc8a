#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use covrelay::model::Pull;
use covrelay::scm::{ScmClient, ScmError, ScmProvider, ScmResult};
use rusqlite::Connection;
use tempfile::TempDir;

/// Create a fresh temporary database, returning the connection, dir handle, and db path.
/// The caller must hold onto `TempDir` to keep the temp directory alive.
pub fn setup_db() -> (Connection, TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let conn = covrelay::db::open(&db_path).unwrap();
    covrelay::db::init_schema(&conn).unwrap();
    (conn, dir, db_path)
}

/// Build an upload envelope from manifest paths and named documents.
pub fn envelope(manifest: &[&str], documents: &[(&str, &str)]) -> Vec<u8> {
    let mut out = String::new();
    for path in manifest {
        out.push_str(path);
        out.push('\n');
    }
    out.push_str("<<<<<< network\n");
    for (path, content) in documents {
        out.push_str(&format!("# path={path}\n{content}\n<<<<<< EOF\n"));
    }
    out.into_bytes()
}

/// A one-class Cobertura document with the given line hits.
pub fn cobertura(source: &str, filename: &str, lines: &[(u32, u64)]) -> String {
    let covered = lines.iter().filter(|(_, hits)| *hits > 0).count();
    let rate = if lines.is_empty() {
        1.0
    } else {
        covered as f64 / lines.len() as f64
    };
    let line_elements: String = lines
        .iter()
        .map(|(n, hits)| format!(r#"<line number="{n}" hits="{hits}"/>"#))
        .collect();
    format!(
        r#"<?xml version="1.0" ?>
<coverage version="5.5" timestamp="1610313969570" lines-valid="{valid}" lines-covered="{covered}" line-rate="{rate}" branches-valid="0" branches-covered="0" branch-rate="0" complexity="0">
    <sources><source>{source}</source></sources>
    <packages><package name="pkg"><classes>
        <class name="{filename}" filename="{filename}" line-rate="{rate}" branch-rate="0" complexity="0">
            <lines>{line_elements}</lines>
        </class>
    </classes></package></packages>
</coverage>"#,
        valid = lines.len(),
    )
}

/// A diff adding `lines` (1-based, contiguous from `start`) to `path`.
pub fn added_lines_diff(path: &str, start: u32, count: u32) -> String {
    let mut out = format!(
        "diff --git a/{path} b/{path}\nindex 1111111..2222222 100644\n--- a/{path}\n+++ b/{path}\n@@ -{old},0 +{start},{count} @@\n",
        old = start.saturating_sub(1),
    );
    for i in 0..count {
        out.push_str(&format!("+line {}\n", start + i));
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckUpdate {
    pub check_id: String,
    pub running: bool,
    pub success: bool,
    pub text: Option<String>,
}

#[derive(Default)]
pub struct FakeState {
    pub pulls: Vec<Pull>,
    pub diffs: HashMap<u64, String>,
    pub files: HashMap<String, Vec<u8>>,
    pub calls: Vec<String>,
    pub comments: HashMap<String, String>,
    pub created_comments: usize,
    pub updated_comments: usize,
    pub created_checks: usize,
    pub check_updates: Vec<CheckUpdate>,
    pub installations: Vec<Option<String>>,
    /// Calls that fail with the given HTTP status instead of running.
    pub failures: HashMap<String, u16>,
}

/// In-memory SCM that records every call.
#[derive(Clone, Default)]
pub struct FakeScm {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeScm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pull(self, id: u64, base: &str, head: &str, diff: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.pulls.push(Pull {
                id,
                base: base.to_string(),
                head: head.to_string(),
            });
            state.diffs.insert(id, diff.to_string());
        }
        self
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    /// Make every `call` fail as the API would with `status`.
    pub fn with_failure(self, call: &str, status: u16) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(call.to_string(), status);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: &str) -> ScmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_string());
        match state.failures.get(call) {
            None => Ok(()),
            Some(401 | 403) => Err(ScmError::Unauthorized(format!("{call} rejected"))),
            Some(404) => Err(ScmError::NotFound(call.to_string())),
            Some(&status) => Err(ScmError::Api {
                status,
                body: format!("{call} failed"),
            }),
        }
    }
}

impl ScmClient for FakeScm {
    fn get_pulls(&self, _org: &str, _repo: &str, _commit: &str) -> ScmResult<Vec<Pull>> {
        self.record("get_pulls")?;
        Ok(self.state.lock().unwrap().pulls.clone())
    }

    fn get_pull_diff(&self, _org: &str, _repo: &str, pull: u64) -> ScmResult<String> {
        self.record("get_pull_diff")?;
        self.state
            .lock()
            .unwrap()
            .diffs
            .get(&pull)
            .cloned()
            .ok_or_else(|| ScmError::NotFound(format!("pull {pull}")))
    }

    fn file_exists(&self, _org: &str, _repo: &str, _commit: &str, path: &str) -> ScmResult<bool> {
        self.record("file_exists")?;
        Ok(self.state.lock().unwrap().files.contains_key(path))
    }

    fn download_file(
        &self,
        _org: &str,
        _repo: &str,
        _commit: &str,
        path: &str,
    ) -> ScmResult<Vec<u8>> {
        self.record("download_file")?;
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ScmError::NotFound(path.to_string()))
    }

    fn create_check(&self, _org: &str, _repo: &str, _commit: &str) -> ScmResult<String> {
        self.record("create_check")?;
        let mut state = self.state.lock().unwrap();
        state.created_checks += 1;
        Ok(format!("check-{}", state.created_checks))
    }

    fn update_check(
        &self,
        _org: &str,
        _repo: &str,
        check_id: &str,
        running: bool,
        success: bool,
        text: Option<&str>,
    ) -> ScmResult<()> {
        self.record("update_check")?;
        self.state.lock().unwrap().check_updates.push(CheckUpdate {
            check_id: check_id.to_string(),
            running,
            success,
            text: text.map(str::to_string),
        });
        Ok(())
    }

    fn create_comment(&self, _org: &str, _repo: &str, _pull: u64, body: &str) -> ScmResult<String> {
        self.record("create_comment")?;
        let mut state = self.state.lock().unwrap();
        state.created_comments += 1;
        let id = format!("comment-{}", state.created_comments);
        state.comments.insert(id.clone(), body.to_string());
        Ok(id)
    }

    fn update_comment(
        &self,
        _org: &str,
        _repo: &str,
        comment_id: &str,
        body: &str,
    ) -> ScmResult<()> {
        self.record("update_comment")?;
        let mut state = self.state.lock().unwrap();
        if !state.comments.contains_key(comment_id) {
            return Err(ScmError::NotFound(format!("comment {comment_id}")));
        }
        state.updated_comments += 1;
        state
            .comments
            .insert(comment_id.to_string(), body.to_string());
        Ok(())
    }
}

impl ScmProvider for FakeScm {
    fn client_for(&self, installation_id: Option<&str>) -> ScmResult<Box<dyn ScmClient>> {
        self.state
            .lock()
            .unwrap()
            .installations
            .push(installation_id.map(str::to_string));
        Ok(Box::new(self.clone()))
    }
}
