//! cpio archives
//!
//! Three header dialects share one entry layout: a fixed header, the
//! NUL-terminated entry name, optional name padding, the file data and
//! optional data padding. The archive ends with an entry named
//! `TRAILER!!!`; whatever follows it is reported as a trailing leaf.
//!
//! | dialect   | magic              | header | alignment |
//! |-----------|--------------------|--------|-----------|
//! | ascii     | `070707`           | 76     | none      |
//! | new-ascii | `070701`, `070702` | 110    | 4         |
//! | binary    | `0x71C7` (either endianness) | 26 | 2    |

use crate::archive::{ArchiveTokenization, Token, TokenKind, TokenValue};
use crate::error::{ArchiveError, Result};
use crate::fields::{self, FieldError};
use crate::formats::{self, FormatParser, HeaderFields};
use crate::loader::ParseContext;
use crate::stream::SubStream;
use std::io::{self, Read, Seek, SeekFrom};

const FORMAT: &str = "cpio";
const TRAILER_NAME: &str = "TRAILER!!!";
const BINARY_MAGIC: u16 = 0o070707;

/// Names longer than this are treated as a corrupt header
const MAX_NAME_SIZE: u64 = 64 * 1024;

const S_IFMT: u64 = 0o170000;
const S_IFREG: u64 = 0o100000;

/// Portable ASCII ("odc") cpio
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiCpioParser;

/// SVR4 "newc" cpio, with or without data checksums
#[derive(Debug, Clone, Copy, Default)]
pub struct NewAsciiCpioParser;

/// Old binary cpio in either byte order
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCpioParser;

impl FormatParser for AsciiCpioParser {
    fn name(&self) -> &'static str {
        "ascii-cpio"
    }

    fn archive_type(&self) -> &'static str {
        FORMAT
    }

    fn try_parse(&self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
        parse_archive(stream, ctx, Dialect::Odc)
    }
}

impl FormatParser for NewAsciiCpioParser {
    fn name(&self) -> &'static str {
        "new-ascii-cpio"
    }

    fn archive_type(&self) -> &'static str {
        FORMAT
    }

    fn try_parse(&self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
        parse_archive(stream, ctx, Dialect::Newc)
    }
}

impl FormatParser for BinaryCpioParser {
    fn name(&self) -> &'static str {
        "binary-cpio"
    }

    fn archive_type(&self) -> &'static str {
        FORMAT
    }

    fn try_parse(&self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
        parse_archive(stream, ctx, Dialect::Binary)
    }
}

/// Why bytes at some offset are not a usable entry of the dialect
#[derive(Debug, thiserror::Error)]
enum EntryError {
    #[error("bad header magic {0:?}")]
    Magic(Vec<u8>),
    #[error(transparent)]
    Field(#[from] FieldError),
    /// Header absent, cut short or implausible
    #[error("{0}")]
    Header(String),
    /// Header decoded but the entry does not fit the stream
    #[error("{reason}")]
    Layout { subtype: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Odc,
    Newc,
    Binary,
}

/// Decoded fixed header of one entry
struct EntryHeader {
    subtype: &'static str,
    fields: Vec<Token>,
    mode: u64,
    namesize: u64,
    filesize: u64,
    /// Expected data byte sum, for `new-ascii-crc` only
    check: Option<u32>,
}

/// Header plus the byte layout of the rest of the entry
struct RawEntry {
    header: EntryHeader,
    name_raw: Vec<u8>,
    name_offset: u64,
    name_pad: u64,
    data_offset: u64,
    data_pad: u64,
}

impl RawEntry {
    fn end(&self) -> u64 {
        self.data_offset + self.header.filesize + self.data_pad
    }
}

impl Dialect {
    fn header_len(self) -> usize {
        match self {
            Dialect::Odc => 76,
            Dialect::Newc => 110,
            Dialect::Binary => 26,
        }
    }

    fn alignment(self) -> u64 {
        match self {
            Dialect::Odc => 1,
            Dialect::Newc => 4,
            Dialect::Binary => 2,
        }
    }

    fn decode(self, raw: &[u8], base: u64) -> std::result::Result<EntryHeader, EntryError> {
        match self {
            Dialect::Odc => decode_odc(raw, base),
            Dialect::Newc => decode_newc(raw, base),
            Dialect::Binary => decode_binary(raw, base),
        }
    }
}

fn decode_odc(raw: &[u8], base: u64) -> std::result::Result<EntryHeader, EntryError> {
    if &raw[..6] != b"070707" {
        return Err(EntryError::Magic(raw[..6].to_vec()));
    }
    let mut h = HeaderFields::new(raw, base);
    h.text("magic", 6);
    h.octal("dev", 6)?;
    h.octal("ino", 6)?;
    let mode = h.octal("mode", 6)?;
    h.octal("uid", 6)?;
    h.octal("gid", 6)?;
    h.octal("nlink", 6)?;
    h.octal("rdev", 6)?;
    h.octal("mtime", 11)?;
    let namesize = h.octal("namesize", 6)?;
    let filesize = h.octal("filesize", 11)?;
    Ok(EntryHeader { subtype: "ascii", fields: h.into_fields(), mode, namesize, filesize, check: None })
}

fn decode_newc(raw: &[u8], base: u64) -> std::result::Result<EntryHeader, EntryError> {
    const FIELDS: [&str; 13] = [
        "ino", "mode", "uid", "gid", "nlink", "mtime", "filesize", "devmajor", "devminor", "rdevmajor",
        "rdevminor", "namesize", "check",
    ];

    let subtype = match &raw[..6] {
        b"070701" => "new-ascii",
        b"070702" => "new-ascii-crc",
        other => return Err(EntryError::Magic(other.to_vec())),
    };
    let mut h = HeaderFields::new(raw, base);
    h.text("magic", 6);
    let mut values = [0u64; 13];
    for (value, name) in values.iter_mut().zip(FIELDS) {
        *value = h.hex(name, 8)?;
    }
    // 8 hex digits always fit in a u32
    let check = (subtype == "new-ascii-crc").then_some(values[12] as u32);
    Ok(EntryHeader {
        subtype,
        fields: h.into_fields(),
        mode: values[1],
        namesize: values[11],
        filesize: values[6],
        check,
    })
}

fn decode_binary(raw: &[u8], base: u64) -> std::result::Result<EntryHeader, EntryError> {
    let (subtype, word): (&'static str, fn(&[u8], usize) -> u16) = if fields::le_u16(raw, 0) == BINARY_MAGIC {
        ("binary", fields::le_u16)
    } else if fields::be_u16(raw, 0) == BINARY_MAGIC {
        ("binary-be", fields::be_u16)
    } else {
        return Err(EntryError::Magic(raw[..2].to_vec()));
    };
    // 32-bit values are stored as two words, most significant first
    let long = |at: usize| (u64::from(word(raw, at)) << 16) | u64::from(word(raw, at + 2));

    let mut h = HeaderFields::new(raw, base);
    h.integer("magic", 2, u64::from(BINARY_MAGIC));
    for (i, name) in ["dev", "ino"].into_iter().enumerate() {
        h.integer(name, 2, u64::from(word(raw, 2 + 2 * i)));
    }
    let mode = h.integer("mode", 2, u64::from(word(raw, 6)));
    for (i, name) in ["uid", "gid", "nlink", "rdev"].into_iter().enumerate() {
        h.integer(name, 2, u64::from(word(raw, 8 + 2 * i)));
    }
    h.integer("mtime", 4, long(16));
    let namesize = h.integer("namesize", 2, u64::from(word(raw, 20)));
    let filesize = h.integer("filesize", 4, long(22));
    Ok(EntryHeader { subtype, fields: h.into_fields(), mode, namesize, filesize, check: None })
}

/// Read and lay out the entry at `offset`.
///
/// The outer error is an I/O failure; the inner one says the bytes are not
/// an entry of this dialect.
fn read_entry(
    stream: &mut SubStream<'_>,
    dialect: Dialect,
    offset: u64,
) -> io::Result<std::result::Result<RawEntry, EntryError>> {
    let total = stream.len();
    let header_len = dialect.header_len();

    stream.seek(SeekFrom::Start(offset))?;
    let raw = match formats::read_block(stream, header_len)? {
        Some(raw) if raw.len() == header_len => raw,
        Some(raw) => {
            return Ok(Err(EntryError::Header(format!("truncated header ({} of {} bytes)", raw.len(), header_len))))
        }
        None => return Ok(Err(EntryError::Header(format!("missing {} entry", TRAILER_NAME)))),
    };
    let header = match dialect.decode(&raw, offset) {
        Ok(header) => header,
        Err(e) => return Ok(Err(e)),
    };

    if header.namesize == 0 || header.namesize > MAX_NAME_SIZE {
        return Ok(Err(EntryError::Header(format!("implausible name size {}", header.namesize))));
    }
    let name_offset = offset + header_len as u64;
    let name_end = name_offset + header.namesize;
    let name_pad = fields::padding_needed(name_end, dialect.alignment());
    let data_offset = name_end + name_pad;
    let data_end = data_offset.saturating_add(header.filesize);
    let data_pad = fields::padding_needed(data_end, dialect.alignment());
    if data_end.saturating_add(data_pad) > total {
        return Ok(Err(EntryError::Layout {
            subtype: header.subtype,
            reason: format!(
                "entry of {} bytes at offset {} runs past end of stream ({} bytes)",
                header.filesize, offset, total
            ),
        }));
    }

    stream.seek(SeekFrom::Start(name_offset))?;
    let mut name_raw = vec![0u8; header.namesize as usize];
    stream.read_exact(&mut name_raw)?;

    Ok(Ok(RawEntry { header, name_raw, name_offset, name_pad, data_offset, data_pad }))
}

/// Wrapping sum of `len` bytes at `offset`, as used by `070702` archives
fn byte_sum(stream: &mut SubStream<'_>, offset: u64, len: u64) -> io::Result<u32> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut limited = stream.by_ref().take(len);
    let mut buf = [0u8; 8192];
    let mut sum = 0u32;
    loop {
        let n = limited.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sum = buf[..n].iter().fold(sum, |acc, &b| acc.wrapping_add(u32::from(b)));
    }
    Ok(sum)
}

fn parse_archive(
    stream: &mut SubStream<'_>,
    ctx: &ParseContext<'_>,
    dialect: Dialect,
) -> Result<Option<ArchiveTokenization>> {
    let mut tokens = Vec::new();
    let mut subtype: Option<&'static str> = None;
    let mut offset = 0u64;

    loop {
        ctx.check_cancelled()?;

        let entry = match read_entry(stream, dialect, offset) {
            Ok(Ok(entry)) => entry,
            Ok(Err(reason)) => match (subtype, &reason) {
                // a sound first header commits to the format
                (None, EntryError::Layout { subtype, .. }) => {
                    return Err(ArchiveError::malformed(FORMAT, *subtype, offset, reason.to_string()))
                }
                (None, _) => {
                    tracing::trace!(?dialect, %reason, "not a cpio archive");
                    return Ok(None);
                }
                (Some(subtype), _) => {
                    return Err(ArchiveError::malformed(FORMAT, subtype, offset, reason.to_string()))
                }
            },
            Err(e) => {
                return match subtype {
                    None if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
                    None => Err(e.into()),
                    Some(subtype) => Err(formats::committed_io(e, FORMAT, subtype, offset)),
                }
            }
        };

        let archive_subtype = *subtype.get_or_insert(entry.header.subtype);
        if entry.header.subtype != archive_subtype {
            return Err(ArchiveError::malformed(
                FORMAT,
                archive_subtype,
                offset,
                format!("entry header switches to {}", entry.header.subtype),
            ));
        }

        let name = fields::nul_terminated(&entry.name_raw);
        let is_trailer = name == TRAILER_NAME && entry.header.filesize == 0;
        tracing::trace!(entry = %name, offset, size = entry.header.filesize, "cpio entry");

        if let Some(expected) = entry.header.check {
            let actual = byte_sum(stream, entry.data_offset, entry.header.filesize)?;
            if actual != expected {
                return Err(ArchiveError::malformed(
                    FORMAT,
                    archive_subtype,
                    offset,
                    format!("checksum mismatch for {}: header {:#x}, data {:#x}", name, expected, actual),
                ));
            }
        }

        let end = entry.end();
        let RawEntry { header, name_raw, name_offset, name_pad, data_offset, data_pad } = entry;

        let mut header_fields = header.fields;
        header_fields.push(Token::raw_leaf(
            TokenKind::Field,
            "name",
            TokenValue::Text(name.clone()),
            name_offset,
            &name_raw,
        ));
        if name_pad > 0 {
            header_fields.push(formats::padding_leaf(stream, "name-padding", name_offset + header.namesize, name_pad)?);
        }

        let mut children = vec![Token::group(TokenKind::Header, "header", header_fields)];
        if header.filesize > 0 || header.mode & S_IFMT == S_IFREG {
            children.push(formats::payload_leaf(stream, ctx, &name, data_offset, header.filesize)?);
        }
        if data_pad > 0 {
            children.push(formats::padding_leaf(stream, "padding", data_offset + header.filesize, data_pad)?);
        }

        let kind = if is_trailer { TokenKind::Trailer } else { TokenKind::Entry };
        tokens.push(Token::group(kind, name, children));
        offset = end;

        if is_trailer {
            break;
        }
    }

    if let Some(trailing) = formats::trailing_leaf(stream, ctx, offset)? {
        tokens.push(trailing);
    }

    let subtype = subtype.unwrap_or("ascii");
    formats::finish(stream, FORMAT, subtype, tokens).map(Some)
}
