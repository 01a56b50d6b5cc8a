/// Splitter for the multi-file upload envelope.
///
/// Envelope structure:
///   <manifest path>
///   <manifest path>
///   <<<<<< network
///   # path=<report name>
///   <report text>
///   <<<<<< EOF
///   # path=<report name>
///   ...
///   <<<<<< EOF
///
/// Uploads may be gzip-compressed as a whole.
use std::collections::HashSet;
use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::{RelayError, Result};

pub const NETWORK_MARKER: &str = "<<<<<< network";
pub const EOF_MARKER: &str = "<<<<<< EOF";
const PATH_HEADER: &str = "# path=";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The list of canonical paths the uploader measured.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    paths: HashSet<String>,
}

impl Manifest {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Resolve a report filename against the manifest.
    ///
    /// A filename already in the manifest is returned unchanged. Otherwise the
    /// trailing segments of `base_path` are prepended one at a time, nearest
    /// first, until the result is a manifest entry. `None` means the file
    /// cannot be placed and should be dropped.
    pub fn resolve(&self, filename: &str, base_path: &str) -> Option<String> {
        if self.contains(filename) {
            return Some(filename.to_string());
        }
        let mut candidate = filename.to_string();
        for part in base_path.rsplit('/') {
            candidate = format!("{part}/{candidate}");
            if self.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// One embedded file of the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub manifest: Manifest,
    pub sections: Vec<Section>,
}

/// Decompress (when gzip) and decode an upload into text.
pub fn decode_upload(input: &[u8]) -> Result<String> {
    let raw = if input.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(input)
            .read_to_end(&mut out)
            .map_err(|e| RelayError::Parse(format!("Invalid gzip upload: {e}")))?;
        out
    } else {
        input.to_vec()
    };
    String::from_utf8(raw).map_err(|e| RelayError::Parse(format!("Upload is not valid UTF-8: {e}")))
}

/// Split envelope text into its manifest and embedded sections.
pub fn split_envelope(text: &str) -> Envelope {
    let (toc, files) = match text.split_once(NETWORK_MARKER) {
        Some((toc, files)) => (toc, files),
        None => (text, ""),
    };

    let manifest = Manifest::new(
        toc.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string),
    );

    Envelope {
        manifest,
        sections: split_sections(files),
    }
}

fn split_sections(data: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current: Option<String> = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in data.trim().lines() {
        if line.trim_end() == EOF_MARKER {
            if let Some(path) = current.take() {
                sections.push(Section {
                    path,
                    content: lines.join("\n"),
                });
            }
            lines.clear();
        } else if current.is_none() {
            // First line of a section names the embedded file.
            let path = line
                .split_once(PATH_HEADER)
                .map(|(_, p)| p.trim())
                .unwrap_or("");
            current = Some(path.to_string());
        } else {
            lines.push(line);
        }
    }

    // Unterminated trailing section.
    if let Some(path) = current {
        if !lines.is_empty() {
            sections.push(Section {
                path,
                content: lines.join("\n"),
            });
        }
    }

    sections
}
