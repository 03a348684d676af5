//! Tokenization decoder (JSON)

use crate::archive::ArchiveTokenization;
use crate::error::{ArchiveError, Result};
use std::io::Read;
use std::path::Path;

/// Reads a tokenization back from the JSON written by [`crate::Encoder`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    /// Reject trees whose leaves do not tile the archive
    verify_coverage: bool,
}

impl Decoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Check leaf coverage of every decoded tree
    pub fn with_verify_coverage(mut self, verify: bool) -> Self {
        self.verify_coverage = verify;
        self
    }

    /// Decode a tokenization from a string
    pub fn decode(&self, input: &str) -> Result<ArchiveTokenization> {
        let tokens: ArchiveTokenization = serde_json::from_str(input)?;
        self.check(tokens)
    }

    /// Decode a tokenization from a reader
    pub fn decode_reader<R: Read>(&self, reader: R) -> Result<ArchiveTokenization> {
        let tokens: ArchiveTokenization = serde_json::from_reader(reader)?;
        self.check(tokens)
    }

    /// Decode a tokenization from a file
    pub fn decode_file(&self, path: &Path) -> Result<ArchiveTokenization> {
        let file = std::fs::File::open(path)?;
        self.decode_reader(std::io::BufReader::new(file))
    }

    fn check(&self, tokens: ArchiveTokenization) -> Result<ArchiveTokenization> {
        // Always enforced: later span arithmetic relies on it
        if let Err(e) = tokens.verify_values() {
            return Err(ArchiveError::malformed(
                tokens.archive_type(),
                tokens.subtype(),
                0,
                format!("inconsistent token: {}", e),
            ));
        }
        if self.verify_coverage {
            if let Err(e) = tokens.verify_coverage() {
                return Err(ArchiveError::malformed(
                    tokens.archive_type(),
                    tokens.subtype(),
                    0,
                    format!("token tree does not cover the archive: {}", e),
                ));
            }
        }
        tracing::trace!(
            archive_type = tokens.archive_type(),
            leaves = tokens.leaves().len(),
            "decoded tokenization"
        );
        Ok(tokens)
    }
}
