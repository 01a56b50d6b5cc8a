//! Join diff-added lines against the coverage report's line hits.

use crate::model::{rate, CoverageData, DiffCoverage};

/// Compute per-file and overall diff coverage.
///
/// Files absent from the coverage report are dropped. Only added lines that
/// the report instruments count toward a file's total; a file (or a whole
/// diff) with nothing instrumented is fully covered.
pub fn get_line_rate(diff: &[DiffCoverage], coverage: &CoverageData) -> (Vec<DiffCoverage>, f64) {
    let mut entries = Vec::with_capacity(diff.len());
    let mut total: u64 = 0;
    let mut covered: u64 = 0;

    for ddata in diff {
        let Some(file) = coverage.file_coverage.get(&ddata.filename) else {
            continue;
        };

        let mut hits: u64 = 0;
        let mut misses: u64 = 0;
        for line in &ddata.lines {
            match file.lines.get(line) {
                Some(&count) if count > 0 => hits += 1,
                Some(_) => misses += 1,
                None => {}
            }
        }

        total += hits + misses;
        covered += hits;
        entries.push(DiffCoverage {
            filename: ddata.filename.clone(),
            lines: ddata.lines.clone(),
            line_rate: rate(hits, hits + misses),
            hits,
            misses,
        });
    }

    (entries, rate(covered, total))
}
