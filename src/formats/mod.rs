//! Format parsers
//!
//! Every supported container implements [`FormatParser`]. A parser sees the
//! candidate archive through a [`SubStream`] whose offset 0 is the archive
//! start, and either declines (`Ok(None)`), accepts with a tokenization that
//! covers the whole view, or fails. Once a parser has passed its signature
//! gate, inconsistent data is reported as [`ArchiveError::Malformed`] rather
//! than a decline.

pub mod cpio;
pub mod ext4;
pub mod swupdate;
pub mod tar;

use std::io::{self, Read, Seek, SeekFrom};

use sha2::{Digest, Sha256};

use crate::archive::{ArchiveTokenization, Span, Token, TokenKind, TokenValue};
use crate::error::{ArchiveError, Result};
use crate::fields::{self, FieldError};
use crate::loader::ParseContext;
use crate::stream::{self, SubStream};

/// "Try this format" capability
pub trait FormatParser: Send + Sync {
    /// Unique registration name
    fn name(&self) -> &'static str;

    /// Archive type family this parser produces
    fn archive_type(&self) -> &'static str;

    /// Tokenize `stream` or decline
    fn try_parse(
        &self,
        stream: &mut SubStream<'_>,
        ctx: &ParseContext<'_>,
    ) -> Result<Option<ArchiveTokenization>>;
}

/// Wrap `tokens` into a tokenization covering all of `stream`
pub(crate) fn finish(
    stream: &mut SubStream<'_>,
    archive_type: &str,
    subtype: &str,
    tokens: Vec<Token>,
) -> Result<ArchiveTokenization> {
    let length = stream.len();
    let sha256 = stream::hash_range(stream, 0, length)?;
    Ok(ArchiveTokenization::new(archive_type, subtype, length, sha256, tokens))
}

/// Sequential field decoder over one raw header.
///
/// Each call consumes the next `len` bytes and records a field leaf, so the
/// fields of a finished header tile it exactly.
pub(crate) struct HeaderFields<'h> {
    raw: &'h [u8],
    base: u64,
    cursor: usize,
    fields: Vec<Token>,
}

impl<'h> HeaderFields<'h> {
    /// `raw` holds the header bytes found at absolute offset `base`
    pub fn new(raw: &'h [u8], base: u64) -> Self {
        Self { raw, base, cursor: 0, fields: Vec::new() }
    }

    fn take(&mut self, len: usize) -> &'h [u8] {
        let end = (self.cursor + len).min(self.raw.len());
        let slice = &self.raw[self.cursor..end];
        self.cursor = end;
        slice
    }

    fn push(&mut self, name: &str, value: TokenValue, offset: usize, raw: &[u8]) {
        self.fields.push(Token::raw_leaf(
            TokenKind::Field,
            name,
            value,
            self.base + offset as u64,
            raw,
        ));
    }

    /// Field kept as text up to its first NUL
    pub fn text(&mut self, name: &'static str, len: usize) -> String {
        let at = self.cursor;
        let raw = self.take(len);
        let text = fields::nul_terminated(raw);
        self.push(name, TokenValue::Text(text.clone()), at, raw);
        text
    }

    pub fn octal(&mut self, name: &'static str, len: usize) -> std::result::Result<u64, FieldError> {
        let at = self.cursor;
        let raw = self.take(len);
        let value = fields::parse_octal(name, raw)?;
        self.push(name, TokenValue::Integer(value), at, raw);
        Ok(value)
    }

    pub fn hex(&mut self, name: &'static str, len: usize) -> std::result::Result<u64, FieldError> {
        let at = self.cursor;
        let raw = self.take(len);
        let value = fields::parse_hex(name, raw)?;
        self.push(name, TokenValue::Integer(value), at, raw);
        Ok(value)
    }

    /// Field whose value the caller already decoded
    pub fn integer(&mut self, name: &'static str, len: usize, value: u64) -> u64 {
        let at = self.cursor;
        let raw = self.take(len);
        self.push(name, TokenValue::Integer(value), at, raw);
        value
    }

    /// Little-endian unsigned field of up to 8 bytes
    pub fn le(&mut self, name: &'static str, len: usize) -> u64 {
        let at = self.cursor;
        let raw = self.take(len);
        let value = raw.iter().rev().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        self.push(name, TokenValue::Integer(value), at, raw);
        value
    }

    /// Field kept only as bytes
    pub fn bytes(&mut self, name: &'static str, len: usize) {
        let at = self.cursor;
        let raw = self.take(len);
        self.push(name, TokenValue::Bytes(raw.to_vec()), at, raw);
    }

    /// Field leaves so far; unread bytes become a `reserved` field
    pub fn into_fields(mut self) -> Vec<Token> {
        if self.cursor < self.raw.len() {
            let rest = self.raw.len() - self.cursor;
            self.bytes("reserved", rest);
        }
        self.fields
    }

    /// Close the header into a `Header` token
    pub fn finish(self, name: impl Into<String>) -> Token {
        Token::group(TokenKind::Header, name, self.into_fields())
    }
}

/// Leaf for a content region (payload, gap, trailing bytes).
///
/// The value is a digest, or `Zeros` for an all-zero region; the bytes are
/// kept when the region is no larger than the inline limit.
pub(crate) fn content_leaf(
    stream: &mut SubStream<'_>,
    ctx: &ParseContext<'_>,
    kind: TokenKind,
    name: impl Into<String>,
    offset: u64,
    len: u64,
) -> io::Result<Token> {
    let keep = len <= ctx.config().inline_payload_limit;
    let mut kept = Vec::new();
    let mut hasher = Sha256::new();
    let mut zero = true;

    stream.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        let n = stream::read_up_to(stream, &mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "content region past end of stream"));
        }
        let chunk = &buf[..n];
        hasher.update(chunk);
        zero &= chunk.iter().all(|&b| b == 0);
        if keep {
            kept.extend_from_slice(chunk);
        }
        remaining -= n as u64;
    }

    let value = if zero && len > 0 {
        TokenValue::Zeros(len)
    } else {
        TokenValue::Sha256(hex::encode(hasher.finalize()))
    };
    let mut token = Token::leaf(kind, name, value, Span::new(offset, len));
    if keep {
        token.raw = Some(kept);
    }
    Ok(token)
}

/// Leaf for alignment padding (always small, always kept)
pub(crate) fn padding_leaf(stream: &mut SubStream<'_>, name: impl Into<String>, offset: u64, len: u64) -> io::Result<Token> {
    let raw = stream::read_at(stream, offset, len as usize)?;
    let value = if fields::is_all_zero(&raw) {
        TokenValue::Zeros(len)
    } else {
        TokenValue::Bytes(raw.clone())
    };
    Ok(Token::raw_leaf(TokenKind::Padding, name, value, offset, &raw))
}

/// Leaf for whatever follows an archive's terminator, if anything
pub(crate) fn trailing_leaf(
    stream: &mut SubStream<'_>,
    ctx: &ParseContext<'_>,
    offset: u64,
) -> io::Result<Option<Token>> {
    let len = stream.len().saturating_sub(offset);
    if len == 0 {
        return Ok(None);
    }
    let kind = if stream::is_zero_range(stream, offset, len)? {
        TokenKind::Padding
    } else {
        TokenKind::Gap
    };
    content_leaf(stream, ctx, kind, "trailing", offset, len).map(Some)
}

/// Payload leaf for an entry, with nested archive detection applied
pub(crate) fn payload_leaf(
    stream: &mut SubStream<'_>,
    ctx: &ParseContext<'_>,
    name: &str,
    offset: u64,
    len: u64,
) -> Result<Token> {
    let token = content_leaf(stream, ctx, TokenKind::Payload, name, offset, len)?;
    if len == 0 {
        return Ok(token);
    }
    let Some(wanted) = ctx.nested_type_for(name) else {
        return Ok(token);
    };
    let types: Vec<&str> = wanted.into_iter().collect();
    let mut view = stream.slice(offset, len)?;
    match ctx.detect_in_entry(name, &mut view, Some(offset), &types)? {
        Some(nested) => {
            tracing::info!(
                entry = name,
                archive_type = nested.archive_type(),
                subtype = nested.subtype(),
                depth = ctx.depth() + 1,
                "attached nested archive"
            );
            Ok(token.with_nested(nested))
        }
        None => Ok(token),
    }
}

/// Read up to `len` bytes; `None` at end of stream, fewer bytes when the
/// stream ends inside the block
pub(crate) fn read_block<R: Read + ?Sized>(reader: &mut R, len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; len];
    let n = stream::read_up_to(reader, &mut buf)?;
    if n < len {
        buf.truncate(n);
        return Ok(if n == 0 { None } else { Some(buf) });
    }
    Ok(Some(buf))
}

/// Map an I/O failure after commitment: running out of data is malformed
/// input, anything else is a collaborator error
pub(crate) fn committed_io(err: io::Error, format: &str, subtype: &str, offset: u64) -> ArchiveError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ArchiveError::malformed(format, subtype, offset, format!("truncated data: {}", err))
    } else {
        ArchiveError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields_tile_header() {
        let raw = b"070707000644rest";
        let mut header = HeaderFields::new(raw, 100);
        assert_eq!(header.text("magic", 6), "070707");
        assert_eq!(header.octal("mode", 6).unwrap(), 0o644);
        let token = header.finish("hdr");

        assert_eq!(token.kind, TokenKind::Header);
        assert_eq!(token.span, Some(Span::new(100, 16)));
        let names: Vec<&str> = token.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["magic", "mode", "reserved"]);
        assert_eq!(token.children[2].raw.as_deref(), Some(&b"rest"[..]));
        assert_eq!(token.children[1].span, Some(Span::new(106, 6)));
    }

    #[test]
    fn test_header_fields_report_bad_field() {
        let raw = b"zzzzzz";
        let mut header = HeaderFields::new(raw, 0);
        let err = header.hex("ino", 6).unwrap_err();
        assert_eq!(err.field, "ino");
    }

    #[test]
    fn test_header_fields_little_endian() {
        let raw = [0x53, 0xEF, 0x01, 0x00, 0x00, 0x00];
        let mut header = HeaderFields::new(&raw, 0x438);
        assert_eq!(header.le("magic", 2), 0xEF53);
        assert_eq!(header.le("state", 4), 1);
        let fields = header.into_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].value, TokenValue::Integer(1));
        assert_eq!(fields[1].span, Some(Span::new(0x43A, 4)));
    }

    #[test]
    fn test_read_block_short() {
        let mut data: &[u8] = b"abc";
        assert_eq!(read_block(&mut data, 5).unwrap(), Some(b"abc".to_vec()));
        let mut empty: &[u8] = b"";
        assert_eq!(read_block(&mut empty, 5).unwrap(), None);
    }

    #[test]
    fn test_committed_io_maps_eof_to_malformed() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(committed_io(eof, "tar", "old-style", 9), ArchiveError::Malformed { offset: 9, .. }));
        let other = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(committed_io(other, "tar", "old-style", 9), ArchiveError::Io(_)));
    }
}
