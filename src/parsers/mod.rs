pub mod cobertura;
pub mod envelope;

use tracing::debug;

use crate::error::{RelayError, Result};
use crate::model::CoverageData;

/// Parse a raw upload (optionally gzip-compressed) into coverage data.
///
/// Embedded documents are tried in order and the first one that parses is
/// used; documents that fail to parse are skipped. Fails only when no
/// document in the envelope is usable.
pub fn parse_raw_coverage_data(input: &[u8]) -> Result<CoverageData> {
    let text = envelope::decode_upload(input)?;
    let envelope = envelope::split_envelope(&text);

    for section in &envelope.sections {
        match cobertura::parse_document(section.content.as_bytes(), &envelope.manifest) {
            Ok(data) => {
                debug!(
                    path = %section.path,
                    files = data.file_coverage.len(),
                    manifest = envelope.manifest.len(),
                    "parsed coverage document"
                );
                return Ok(data);
            }
            Err(err) => {
                debug!(path = %section.path, error = %err, "skipping unparseable document");
            }
        }
    }

    Err(RelayError::Parse("Could not find coverage file".to_string()))
}
