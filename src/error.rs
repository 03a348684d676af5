//! Error taxonomy for detection and tokenization.
//!
//! "Not this format" is never an error: parsers decline with `Ok(None)` and
//! the loader reports an unsupported stream as `Ok(None)` as well. The
//! variants below are for callers' mistakes, corrupt-but-recognized data and
//! collaborator failures.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors raised by the registry, the loader and the format parsers.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// A type hint matched no registered format
    #[error("unknown format hint: '{hint}' matches no registered archive type")]
    UnknownFormatHint {
        /// The hint as supplied by the caller
        hint: String,
    },

    /// The same parser was registered twice
    #[error("duplicate registration of archive parser '{name}'")]
    DuplicateRegistration {
        /// Parser name
        name: String,
    },

    /// A parser committed to its format and then found inconsistent data
    #[error("malformed {format} ({subtype}) archive at offset {offset}: {reason}")]
    Malformed {
        /// Archive type being parsed
        format: String,
        /// Archive subtype being parsed
        subtype: String,
        /// Byte offset of the structure that failed
        offset: u64,
        /// What was wrong
        reason: String,
    },

    /// A parser failed in a way that only rules out its own format
    #[error("{format} parser gave up: {reason}")]
    Recoverable {
        /// Archive type being parsed
        format: String,
        /// Why the attempt was abandoned
        reason: String,
    },

    /// Nested archives went deeper than the configured limit
    #[error("nested archive depth {depth} exceeds the configured maximum")]
    DepthExceeded {
        /// Depth that was refused
        depth: usize,
    },

    /// The caller cancelled the load
    #[error("archive load cancelled")]
    Cancelled,

    /// Stream or scratch-space I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialized tokenization could not be read or written
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArchiveError {
    /// Build a [`ArchiveError::Malformed`] error.
    pub fn malformed(
        format: impl Into<String>,
        subtype: impl Into<String>,
        offset: u64,
        reason: impl Into<String>,
    ) -> Self {
        ArchiveError::Malformed {
            format: format.into(),
            subtype: subtype.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Whether the loader must stop trying further candidates.
    ///
    /// Only [`ArchiveError::Recoverable`] lets detection continue with the
    /// next format.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ArchiveError::Recoverable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message_names_format_and_offset() {
        let err = ArchiveError::malformed("cpio", "new-ascii", 220, "truncated payload");
        let msg = err.to_string();
        assert!(msg.contains("cpio"));
        assert!(msg.contains("new-ascii"));
        assert!(msg.contains("220"));
        assert!(msg.contains("truncated payload"));
    }

    #[test]
    fn test_only_recoverable_is_non_fatal() {
        let recoverable = ArchiveError::Recoverable {
            format: "ext4".into(),
            reason: "unsupported feature".into(),
        };
        assert!(!recoverable.is_fatal());
        assert!(ArchiveError::Cancelled.is_fatal());
        assert!(ArchiveError::malformed("tar", "old-style", 0, "x").is_fatal());
        let io = ArchiveError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_fatal());
    }
}
