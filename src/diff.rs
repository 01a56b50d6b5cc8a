/// Parse a unified diff to extract which lines were added in each file.
/// This is the input side of "diff coverage": what percentage of the lines a
/// pull request introduces are covered by tests.
///
/// Binary files and deleted files never contribute lines; files whose hunks
/// add nothing are omitted.
use crate::model::DiffCoverage;

/// One file entry of the diff while it is being read.
#[derive(Debug, Default)]
struct FileEntry {
    source: Option<String>,
    target: Option<String>,
    binary: bool,
    deleted: bool,
    lines: Vec<u32>,
}

impl FileEntry {
    fn finish(self) -> Option<DiffCoverage> {
        if self.binary || self.deleted || self.lines.is_empty() {
            return None;
        }
        let filename = self.target.or(self.source)?;
        Some(DiffCoverage::new(filename, self.lines))
    }
}

/// Position inside the current hunk.
#[derive(Debug, Clone, Copy)]
struct Hunk {
    new_line: u32,
    old_remaining: u32,
    new_remaining: u32,
}

impl Hunk {
    fn is_open(&self) -> bool {
        self.old_remaining > 0 || self.new_remaining > 0
    }
}

/// Parse a unified diff (e.g., `git diff` or a pull request `.diff`) into
/// one `DiffCoverage` per file with added lines, in diff order. Reconciled
/// fields are left at zero.
pub fn parse_diff(diff_text: &str) -> Vec<DiffCoverage> {
    let mut result = Vec::new();
    let mut current: Option<FileEntry> = None;
    let mut hunk: Option<Hunk> = None;

    for line in diff_text.lines() {
        let open_hunk = hunk.as_mut().filter(|h| h.is_open());
        if let (Some(entry), Some(h)) = (current.as_mut(), open_hunk) {
            let consumed = match line.as_bytes().first() {
                Some(b'+') => {
                    entry.lines.push(h.new_line);
                    h.new_line += 1;
                    h.new_remaining = h.new_remaining.saturating_sub(1);
                    true
                }
                Some(b'-') => {
                    h.old_remaining = h.old_remaining.saturating_sub(1);
                    true
                }
                // "\ No newline at end of file" is diff metadata, not a real line
                Some(b'\\') => true,
                // Context line; some tools strip the leading space of blank lines.
                Some(b' ') | None => {
                    h.new_line += 1;
                    h.old_remaining = h.old_remaining.saturating_sub(1);
                    h.new_remaining = h.new_remaining.saturating_sub(1);
                    true
                }
                // Malformed hunk; treat the line as a header.
                Some(_) => false,
            };
            if consumed {
                continue;
            }
            hunk = None;
        }

        if line.starts_with("diff --git ") {
            finish_entry(&mut result, current.take());
            hunk = None;
            current = Some(FileEntry {
                target: git_header_target(line),
                ..Default::default()
            });
        } else if let Some(rest) = line.strip_prefix("--- ") {
            // Plain `diff -u` output has no "diff --git" line; a new "---"
            // after a completed header starts the next file.
            let starts_new = match current.as_ref() {
                None => true,
                Some(entry) => entry.source.is_some() || hunk.is_some(),
            };
            if starts_new {
                finish_entry(&mut result, current.take());
                current = Some(FileEntry::default());
            }
            hunk = None;
            if let Some(entry) = current.as_mut() {
                entry.source = header_path(rest);
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(entry) = current.as_mut() {
                match header_path(rest) {
                    Some(path) => entry.target = Some(path),
                    None => entry.deleted = true,
                }
            }
        } else if line.starts_with("@@ ") {
            hunk = parse_hunk_header(line);
        } else if line.starts_with("deleted file mode") {
            if let Some(entry) = current.as_mut() {
                entry.deleted = true;
            }
        } else if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
            if let Some(entry) = current.as_mut() {
                entry.binary = true;
            }
        }
    }

    finish_entry(&mut result, current.take());
    result
}

fn finish_entry(result: &mut Vec<DiffCoverage>, entry: Option<FileEntry>) {
    if let Some(diff) = entry.and_then(FileEntry::finish) {
        result.push(diff);
    }
}

/// Path from a "---"/"+++" header, or `None` for `/dev/null`.
fn header_path(rest: &str) -> Option<String> {
    // Some tools append a tab and a timestamp.
    let raw = rest.split('\t').next().unwrap_or(rest).trim_end();
    if raw == "/dev/null" {
        return None;
    }
    // Strip common VCS prefixes: "b/" (default git), "a/" (some tools).
    let path = raw
        .strip_prefix("b/")
        .or_else(|| raw.strip_prefix("a/"))
        .unwrap_or(raw);
    Some(path.to_string())
}

/// Target path from "diff --git a/x b/y", used when no "+++" header follows
/// (e.g. pure renames or binary files).
fn git_header_target(line: &str) -> Option<String> {
    let rest = line.strip_prefix("diff --git ")?;
    let idx = rest.rfind(" b/")?;
    Some(rest[idx + 3..].to_string())
}

/// Parse a hunk header like "@@ -10,5 +20,8 @@".
fn parse_hunk_header(line: &str) -> Option<Hunk> {
    let after_at = line.strip_prefix("@@ ")?;
    let mut parts = after_at.split(' ');
    let old_part = parts.next()?.strip_prefix('-')?;
    let new_part = parts.next()?.strip_prefix('+')?;
    let (_, old_count) = parse_range(old_part)?;
    let (new_start, new_count) = parse_range(new_part)?;
    Some(Hunk {
        new_line: new_start,
        old_remaining: old_count,
        new_remaining: new_count,
    })
}

/// "start,count" or "start" (count defaults to 1).
fn parse_range(range: &str) -> Option<(u32, u32)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
