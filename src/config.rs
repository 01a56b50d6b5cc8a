//! Repository coverage configuration (`cov.yaml`).
//!
//! ```yaml
//! target: "80%"
//! diff_target: "90%"
//! projects:
//!   ui:
//!     base_path: app
//!     target: "70%"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::model::CoverageData;

/// Path of the configuration file inside the repository.
pub const CONFIG_FILENAME: &str = "cov.yaml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProjectConfiguration {
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default, deserialize_with = "percentage_text")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "percentage_text")]
    pub diff_target: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CoverageConfiguration {
    #[serde(default, deserialize_with = "percentage_text")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "percentage_text")]
    pub diff_target: Option<String>,
    #[serde(default)]
    pub projects: Option<HashMap<String, ProjectConfiguration>>,
}

impl CoverageConfiguration {
    /// Parse `cov.yaml` contents. Malformed YAML yields `None`.
    pub fn from_yaml(text: &str) -> Option<Self> {
        // An empty document deserializes to unit, not a mapping.
        if text.trim().is_empty() {
            return Some(Self::default());
        }
        match serde_norway::from_str::<Self>(text) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "ignoring invalid {CONFIG_FILENAME}");
                None
            }
        }
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfiguration> {
        self.projects.as_ref()?.get(name)
    }

    /// Overall coverage target: project override, then top level.
    pub fn target(&self, project: Option<&str>) -> Option<&str> {
        project
            .and_then(|p| self.project(p))
            .and_then(|p| p.target.as_deref())
            .or(self.target.as_deref())
    }

    /// Diff coverage target: project override, then top level.
    pub fn diff_target(&self, project: Option<&str>) -> Option<&str> {
        project
            .and_then(|p| self.project(p))
            .and_then(|p| p.diff_target.as_deref())
            .or(self.diff_target.as_deref())
    }

    pub fn base_path(&self, project: Option<&str>) -> Option<&str> {
        project
            .and_then(|p| self.project(p))
            .and_then(|p| p.base_path.as_deref())
            .filter(|p| !p.trim_matches('/').is_empty())
    }
}

/// Accept `target: 80` as well as `target: "80%"`.
fn percentage_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Number(n) => n.to_string(),
    }))
}

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*%?\s*$").unwrap());

/// Parse a percentage like `"80%"` or `"72.5"`. Anything unparsable is `None`.
pub fn parse_percentage(value: &str) -> Option<f64> {
    PERCENT_RE
        .captures(value)
        .and_then(|caps| caps[1].parse::<f64>().ok())
}

/// Whether `rate` (0.0 to 1.0) meets the target percentage. A missing or
/// unparsable target always passes.
pub fn hits_target_coverage(target: Option<&str>, rate: f64) -> bool {
    match target.and_then(parse_percentage) {
        // Scale the target, not the rate: 0.57 * 100.0 is 56.99999999999999.
        Some(target) => rate >= target / 100.0,
        None => true,
    }
}

/// Prefix every file path with `base_path`.
pub fn apply_base_path(coverage: &mut CoverageData, base_path: &str) {
    let prefix = base_path.trim_end_matches('/');
    let files = std::mem::take(&mut coverage.file_coverage);
    coverage.file_coverage = files
        .into_iter()
        .map(|(path, data)| (format!("{prefix}/{}", path.trim_start_matches('/')), data))
        .collect::<BTreeMap<_, _>>();
}
