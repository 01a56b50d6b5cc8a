//! Source-control platform boundary: pull lookup, diffs, repository files,
//! checks and comments.

pub mod github;
pub mod token_cache;

use thiserror::Error;

use crate::model::Pull;

#[derive(Error, Debug)]
pub enum ScmError {
    /// Credentials were rejected (HTTP 401/403).
    #[error("API unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    /// Local credential setup is unusable (bad key, missing installation).
    #[error("Invalid credentials: {0}")]
    Credentials(String),
}

pub type ScmResult<T> = std::result::Result<T, ScmError>;

/// Operations the annotator needs from a source-control platform.
pub trait ScmClient {
    /// Pull requests associated with a commit.
    fn get_pulls(&self, org: &str, repo: &str, commit: &str) -> ScmResult<Vec<Pull>>;

    /// Unified diff of a pull request.
    fn get_pull_diff(&self, org: &str, repo: &str, pull: u64) -> ScmResult<String>;

    fn file_exists(&self, org: &str, repo: &str, commit: &str, path: &str) -> ScmResult<bool>;

    fn download_file(&self, org: &str, repo: &str, commit: &str, path: &str)
        -> ScmResult<Vec<u8>>;

    /// Start an in-progress check run on a commit. Returns the check id.
    fn create_check(&self, org: &str, repo: &str, commit: &str) -> ScmResult<String>;

    fn update_check(
        &self,
        org: &str,
        repo: &str,
        check_id: &str,
        running: bool,
        success: bool,
        text: Option<&str>,
    ) -> ScmResult<()>;

    /// Comment on a pull request. Returns the comment id.
    fn create_comment(&self, org: &str, repo: &str, pull: u64, body: &str) -> ScmResult<String>;

    fn update_comment(&self, org: &str, repo: &str, comment_id: &str, body: &str)
        -> ScmResult<()>;
}

/// Hands out clients scoped to an installation (the credential identity a
/// job was uploaded under).
pub trait ScmProvider: Send + Sync {
    fn client_for(&self, installation_id: Option<&str>) -> ScmResult<Box<dyn ScmClient>>;
}
