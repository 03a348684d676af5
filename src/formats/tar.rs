//! tar archives
//!
//! Entries are 512-byte headers followed by their data padded to the next
//! block. Two zero blocks end the archive. A stream that stops cleanly on a
//! header boundary without that terminator is accepted as well.
//!
//! The first header's checksum is the signature: a mismatch there means the
//! stream is not tar. A bad checksum on any later header is malformed input.
//! POSIX ustar fields and GNU long names are decoded when present.

use std::io::{Seek, SeekFrom};

use crate::archive::{ArchiveTokenization, Token, TokenKind, TokenValue};
use crate::error::{ArchiveError, Result};
use crate::fields::{self, FieldError};
use crate::formats::{self, FormatParser, HeaderFields};
use crate::loader::ParseContext;
use crate::stream::{self, SubStream};

const FORMAT: &str = "tar";
const SUBTYPE: &str = "old-style";
const BLOCK: u64 = 512;

const CHKSUM_RANGE: std::ops::Range<usize> = 148..156;
const GNU_LONGNAME: &str = "L";
const GNU_LONGLINK: &str = "K";

/// Longest GNU long name or long link record accepted
const MAX_GNU_EXTENSION: u64 = 64 * 1024;

/// Classic tar, including ustar and GNU extensions of the header
#[derive(Debug, Clone, Copy, Default)]
pub struct OldStyleTarParser;

impl FormatParser for OldStyleTarParser {
    fn name(&self) -> &'static str {
        "old-style-tar"
    }

    fn archive_type(&self) -> &'static str {
        FORMAT
    }

    fn try_parse(&self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
        parse_archive(stream, ctx)
    }
}

#[derive(Debug, thiserror::Error)]
enum HeaderError {
    #[error("header checksum mismatch: stored {stored}, computed {computed}")]
    Checksum { stored: u64, computed: u64 },
    #[error(transparent)]
    Field(#[from] FieldError),
}

struct TarHeader {
    token: Token,
    name: String,
    typeflag: String,
    size: u64,
}

impl TarHeader {
    /// Whether the entry carries file data even when empty
    fn is_regular(&self) -> bool {
        matches!(self.typeflag.as_str(), "" | "0" | "7")
    }

    /// Field name for a GNU long name or long link record
    fn gnu_extension(&self) -> Option<&'static str> {
        match self.typeflag.as_str() {
            GNU_LONGNAME => Some("long-name"),
            GNU_LONGLINK => Some("long-linkname"),
            _ => None,
        }
    }
}

/// Unsigned sum of the header with the checksum field counted as spaces
fn header_checksum(raw: &[u8]) -> u64 {
    raw.iter()
        .enumerate()
        .map(|(i, &b)| if CHKSUM_RANGE.contains(&i) { u64::from(b' ') } else { u64::from(b) })
        .sum()
}

/// Same sum over signed bytes, as written by some historic implementations
fn signed_header_checksum(raw: &[u8]) -> i64 {
    raw.iter()
        .enumerate()
        .map(|(i, &b)| if CHKSUM_RANGE.contains(&i) { i64::from(b' ') } else { i64::from(b as i8) })
        .sum()
}

/// Size field, octal or GNU base-256 for large files
fn parse_size(raw: &[u8]) -> std::result::Result<u64, FieldError> {
    if raw[0] & 0x80 == 0 {
        return fields::parse_octal("size", raw);
    }
    let tail = &raw[raw.len() - 8..];
    if raw[..raw.len() - 8].iter().any(|&b| b & 0x7F != 0) || tail[0] & 0x80 != 0 {
        return Err(FieldError {
            field: "size",
            radix: "base-256",
            text: hex::encode(raw),
        });
    }
    Ok(tail.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

fn decode_header(raw: &[u8], offset: u64) -> std::result::Result<TarHeader, HeaderError> {
    let stored = fields::parse_octal("chksum", &raw[CHKSUM_RANGE])?;
    let computed = header_checksum(raw);
    if stored != computed && i64::try_from(stored).ok() != Some(signed_header_checksum(raw)) {
        return Err(HeaderError::Checksum { stored, computed });
    }

    let mut h = HeaderFields::new(raw, offset);
    let mut name = h.text("name", 100);
    h.octal("mode", 8)?;
    h.octal("uid", 8)?;
    h.octal("gid", 8)?;
    let size = h.integer("size", 12, parse_size(&raw[124..136])?);
    h.octal("mtime", 12)?;
    h.integer("chksum", 8, stored);
    let typeflag = h.text("typeflag", 1);
    h.text("linkname", 100);

    if raw[257..262] == *b"ustar" {
        h.text("magic", 6);
        h.text("version", 2);
        h.text("uname", 32);
        h.text("gname", 32);
        h.bytes("devmajor", 8);
        h.bytes("devminor", 8);
        let prefix = h.text("prefix", 155);
        if !prefix.is_empty() {
            name = format!("{}/{}", prefix, name);
        }
    }

    Ok(TarHeader { token: h.finish("header"), name, typeflag, size })
}

fn parse_archive(stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
    let total = stream.len();
    let mut tokens = Vec::new();
    let mut offset = 0u64;
    let mut long_name: Option<String> = None;

    loop {
        ctx.check_cancelled()?;
        let committed = !tokens.is_empty();

        stream.seek(SeekFrom::Start(offset))?;
        let raw = match formats::read_block(stream, BLOCK as usize)? {
            Some(raw) if raw.len() == BLOCK as usize => raw,
            Some(_) if committed => {
                return Err(ArchiveError::malformed(FORMAT, SUBTYPE, offset, "truncated header block"))
            }
            Some(_) => return Ok(None),
            // Clean end on a block boundary without a terminator
            None if committed => break,
            None => return Ok(None),
        };

        if fields::is_all_zero(&raw) {
            if !committed {
                tracing::trace!("leading zero block, not a tar archive");
                return Ok(None);
            }
            offset = push_terminator(stream, &mut tokens, offset)?;
            break;
        }

        let header = match decode_header(&raw, offset) {
            Ok(header) => header,
            Err(reason) if !committed => {
                tracing::trace!(%reason, "not a tar archive");
                return Ok(None);
            }
            Err(reason) => return Err(ArchiveError::malformed(FORMAT, SUBTYPE, offset, reason.to_string())),
        };

        let data_offset = offset + BLOCK;
        // A header with a valid checksum commits to tar, so an entry that
        // does not fit is malformed even when it is the first one
        let data_end = match data_offset.checked_add(header.size) {
            Some(end) if end <= total => end,
            _ => {
                return Err(ArchiveError::malformed(
                    FORMAT,
                    SUBTYPE,
                    offset,
                    format!("entry of {} bytes runs past end of stream", header.size),
                ))
            }
        };
        let pad = fields::padding_needed(data_end, BLOCK).min(total - data_end);

        if let Some(field) = header.gnu_extension() {
            // GNU long name/link records describe the next entry; their data
            // is header text, not file content
            if header.size > MAX_GNU_EXTENSION {
                return Err(ArchiveError::malformed(
                    FORMAT,
                    SUBTYPE,
                    offset,
                    format!("GNU {} record of {} bytes", field, header.size),
                ));
            }
            let raw_text = stream::read_at(stream, data_offset, header.size as usize)
                .map_err(|e| formats::committed_io(e, FORMAT, SUBTYPE, data_offset))?;
            let text = fields::nul_terminated(&raw_text);
            tracing::trace!(offset, field, value = %text, "GNU extension header");
            if header.typeflag == GNU_LONGNAME {
                long_name = Some(text.clone());
            }

            let mut children = vec![header.token];
            if header.size > 0 {
                children.push(Token::raw_leaf(TokenKind::Field, field, TokenValue::Text(text), data_offset, &raw_text));
            }
            if pad > 0 {
                children.push(formats::padding_leaf(stream, "padding", data_end, pad)?);
            }
            tokens.push(Token::group(TokenKind::Header, header.name, children));
            offset = data_end + pad;
            continue;
        }

        let name = long_name.take().unwrap_or_else(|| header.name.clone());
        tracing::trace!(entry = %name, offset, size = header.size, typeflag = %header.typeflag, "tar entry");

        let has_payload = header.size > 0 || header.is_regular();
        let mut children = vec![header.token];
        if has_payload {
            children.push(formats::payload_leaf(stream, ctx, &name, data_offset, header.size)?);
        }
        if pad > 0 {
            children.push(formats::padding_leaf(stream, "padding", data_end, pad)?);
        }
        tokens.push(Token::group(TokenKind::Entry, name, children));
        offset = data_end + pad;
    }

    if let Some(trailing) = formats::trailing_leaf(stream, ctx, offset)? {
        tokens.push(trailing);
    }
    formats::finish(stream, FORMAT, SUBTYPE, tokens).map(Some)
}

/// Record the end-of-archive marker starting at `offset` and return the
/// offset just past it. The second zero block is optional.
fn push_terminator(stream: &mut SubStream<'_>, tokens: &mut Vec<Token>, offset: u64) -> Result<u64> {
    let mut blocks = vec![formats::padding_leaf(stream, "zero-block", offset, BLOCK)?];
    let second = offset + BLOCK;
    if second + BLOCK <= stream.len() && stream::is_zero_range(stream, second, BLOCK)? {
        blocks.push(formats::padding_leaf(stream, "zero-block", second, BLOCK)?);
    }
    let end = offset + BLOCK * blocks.len() as u64;
    tokens.push(Token::group(TokenKind::Trailer, "end-of-archive", blocks));
    Ok(end)
}
