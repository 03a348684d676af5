//! # emx-archive
//!
//! Archive format detection and tokenization.
//!
//! Given a seekable byte stream, the loader decides which supported container
//! format it holds and produces a hierarchical token tree describing every
//! byte of it: headers field by field, payloads, alignment padding, trailers
//! and regions no structure claims.
//!
//! ## Supported formats
//!
//! | type       | subtypes                                              |
//! |------------|-------------------------------------------------------|
//! | `cpio`     | `ascii`, `new-ascii`, `new-ascii-crc`, `binary`, `binary-be` |
//! | `tar`      | `old-style` (v7, ustar and GNU headers)               |
//! | `ext4`     | `ext2`, `ext3`, `ext4`                                |
//! | `swupdate` | `cpio.<subtype>`, `tar.<subtype>`                     |
//!
//! ## Detection
//!
//! Formats are tried in priority order from a [`FormatRegistry`]. A parser
//! that does not recognize the stream declines and the next one is tried; a
//! stream nobody recognizes yields `Ok(None)`, never an error. Once a parser
//! has recognized its format, inconsistent data is reported as
//! [`ArchiveError::Malformed`].
//!
//! ```no_run
//! use emx_archive::{try_load_archive, DirScratch, Encoder};
//!
//! let mut file = std::fs::File::open("update.swu")?;
//! if let Some(tokens) = try_load_archive(&mut file, &DirScratch::system_temp(), None)? {
//!     println!("{} ({})", tokens.archive_type(), tokens.subtype());
//!     println!("{}", Encoder::new().with_pretty(true).encode(&tokens)?);
//! }
//! # Ok::<(), emx_archive::ArchiveError>(())
//! ```
//!
//! ## Nested archives
//!
//! Payloads that are archives themselves (a tar inside a cpio, an ext4 image
//! inside an SWUpdate package) are tokenized recursively and attached to the
//! payload token, up to [`LoaderConfig::max_depth`] levels.

pub mod archive;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod fields;
pub mod formats;
pub mod loader;
pub mod registry;
pub mod scratch;
pub mod stream;

pub use archive::{sha256_hex, ArchiveTokenization, CoverageError, Span, Token, TokenKind, TokenValue};
pub use decoder::Decoder;
pub use encoder::{write_json, Encoder};
pub use error::{ArchiveError, Result};
pub use formats::FormatParser;
pub use loader::{try_load_archive, ArchiveLoader, CancelToken, LoaderConfig, NestedDetection};
pub use registry::{FormatDescriptor, FormatRegistry};
pub use scratch::{DirScratch, ScratchSpace};
pub use stream::{ReadSeek, SubStream};
