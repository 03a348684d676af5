//! Token tree data structures
//!
//! An [`ArchiveTokenization`] is the immutable result of a successful parse:
//! the archive's `type`/`subtype` identity plus an ordered tree of [`Token`]s.
//!
//! Leaves (tokens without children) carry a [`Span`] and tile the parsed
//! stream: walked in document order, their spans are contiguous from offset 0
//! to the archive length. Nested archives hang off a payload leaf in
//! [`Token::nested`] and their spans are relative to that payload.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Role a token plays in the archive structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    /// One archived member (header + payload + padding)
    Entry,
    /// Header region of an entry
    Header,
    /// A single decoded header field
    Field,
    /// File content
    Payload,
    /// Alignment filler
    Padding,
    /// End-of-archive marker
    Trailer,
    /// Bytes no structure claims
    Gap,
    /// Fixed metadata region (superblock, bitmaps, ...)
    Region,
    /// An archive wrapped by a composite format
    Container,
}

/// Decoded value carried by a token
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenValue {
    /// No value (structural tokens)
    #[default]
    None,
    /// Numeric header field
    Integer(u64),
    /// Textual header field (names, magic strings)
    Text(String),
    /// Raw byte content
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Hex SHA-256 of content that was not inlined
    Sha256(String),
    /// Content known to be this many zero bytes
    Zeros(u64),
}

impl TokenValue {
    /// Digest value for `data`
    pub fn digest_of(data: &[u8]) -> Self {
        TokenValue::Sha256(sha256_hex(data))
    }

    pub fn as_integer(&self) -> Option<u64> {
        match self {
            TokenValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            TokenValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Byte range inside the tokenized stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub offset: u64,
    pub length: u64,
}

impl Span {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// First offset past the span, saturating at `u64::MAX`
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// First offset past the span, `None` if it does not fit in a `u64`
    pub fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// A node of the token tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub name: String,
    #[serde(default)]
    pub value: TokenValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    /// Exact bytes of a leaf, when they are kept
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub raw: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Token>,
    /// Tokenization of an archive stored in this token's bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<ArchiveTokenization>>,
}

impl Token {
    /// Create a leaf token covering `span`
    pub fn leaf(kind: TokenKind, name: impl Into<String>, value: TokenValue, span: Span) -> Self {
        Self {
            kind,
            name: name.into(),
            value,
            span: Some(span),
            raw: None,
            children: Vec::new(),
            nested: None,
        }
    }

    /// Create a leaf that keeps its raw bytes, starting at `offset`
    pub fn raw_leaf(
        kind: TokenKind,
        name: impl Into<String>,
        value: TokenValue,
        offset: u64,
        raw: &[u8],
    ) -> Self {
        let mut token = Self::leaf(kind, name, value, Span::new(offset, raw.len() as u64));
        token.raw = Some(raw.to_vec());
        token
    }

    /// Create a parent token; its span is the union of its children's spans
    pub fn group(kind: TokenKind, name: impl Into<String>, children: Vec<Token>) -> Self {
        let span = match (children.first().and_then(|c| c.span), children.last().and_then(|c| c.span)) {
            (Some(first), Some(last)) => Some(Span::new(first.offset, last.end().saturating_sub(first.offset))),
            _ => None,
        };
        Self {
            kind,
            name: name.into(),
            value: TokenValue::None,
            span,
            raw: None,
            children,
            nested: None,
        }
    }

    pub fn with_value(mut self, value: TokenValue) -> Self {
        self.value = value;
        self
    }

    pub fn with_nested(mut self, nested: ArchiveTokenization) -> Self {
        self.nested = Some(Box::new(nested));
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// First direct child with the given name
    pub fn child(&self, name: &str) -> Option<&Token> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Bytes this leaf stands for, if the tree kept them
    pub fn leaf_bytes(&self) -> Option<&[u8]> {
        if let Some(raw) = &self.raw {
            return Some(raw);
        }
        match &self.value {
            TokenValue::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// Check that a leaf's value and kept bytes agree with its span, here
    /// and in any nested tree
    fn verify_value(&self) -> Result<(), CoverageError> {
        if let Some(span) = self.span {
            if span.checked_end().is_none() {
                return Err(CoverageError::Overflow { name: self.name.clone() });
            }
            let stands_for = match (&self.raw, &self.value) {
                (Some(raw), _) => Some(raw.len() as u64),
                (None, TokenValue::Bytes(data)) => Some(data.len() as u64),
                (None, TokenValue::Zeros(n)) => Some(*n),
                _ => None,
            };
            if let Some(found) = stands_for.filter(|&n| n != span.length) {
                return Err(CoverageError::LengthMismatch {
                    name: self.name.clone(),
                    span: span.length,
                    found,
                });
            }
        }
        if let Some(nested) = &self.nested {
            nested.verify_values()?;
        }
        self.children.iter().try_for_each(Token::verify_value)
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Token>) {
        if self.is_leaf() {
            out.push(self);
        } else {
            for child in &self.children {
                child.collect_leaves(out);
            }
        }
    }

    fn collect_payload_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        if self.kind == TokenKind::Payload {
            out.push(&self.name);
        }
        for child in &self.children {
            child.collect_payload_names(out);
        }
    }

    fn collect_nested<'a>(&'a self, depth: usize, out: &mut Vec<(usize, &'a ArchiveTokenization)>) {
        if let Some(nested) = &self.nested {
            out.push((depth, nested));
            nested.collect_nested(depth + 1, out);
        }
        for child in &self.children {
            child.collect_nested(depth, out);
        }
    }
}

/// Leaf spans do not tile the tokenized stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoverageError {
    #[error("leaf '{name}' has no span")]
    MissingSpan { name: String },
    #[error("leaf '{name}' starts at {found}, expected {expected}")]
    Discontinuity { name: String, expected: u64, found: u64 },
    #[error("leaves cover {covered} bytes of a {length} byte archive")]
    Incomplete { covered: u64, length: u64 },
    #[error("span of '{name}' ends past the largest offset")]
    Overflow { name: String },
    #[error("leaf '{name}' spans {span} bytes but its value stands for {found}")]
    LengthMismatch { name: String, span: u64, found: u64 },
}

/// Immutable result of a successful parse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTokenization {
    #[serde(rename = "type")]
    archive_type: String,
    subtype: String,
    length: u64,
    sha256: String,
    tokens: Vec<Token>,
}

impl ArchiveTokenization {
    /// Assemble a tokenization for an archive of `length` bytes whose
    /// SHA-256 is `sha256` (lowercase hex)
    pub fn new(
        archive_type: impl Into<String>,
        subtype: impl Into<String>,
        length: u64,
        sha256: impl Into<String>,
        tokens: Vec<Token>,
    ) -> Self {
        Self {
            archive_type: archive_type.into(),
            subtype: subtype.into(),
            length,
            sha256: sha256.into(),
            tokens,
        }
    }

    /// Coarse format family (`cpio`, `tar`, `ext4`, `swupdate`)
    pub fn archive_type(&self) -> &str {
        &self.archive_type
    }

    /// Format variant
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// Number of bytes the tokenization covers
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Lowercase hex SHA-256 of the covered bytes
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Top-level tokens in document order
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// All leaves in document order
    pub fn leaves(&self) -> Vec<&Token> {
        let mut out = Vec::new();
        for token in &self.tokens {
            token.collect_leaves(&mut out);
        }
        out
    }

    /// Check that leaf spans are contiguous and cover `0..length`
    pub fn verify_coverage(&self) -> Result<(), CoverageError> {
        let mut expected = 0u64;
        for leaf in self.leaves() {
            let span = leaf.span.ok_or_else(|| CoverageError::MissingSpan {
                name: leaf.name.clone(),
            })?;
            if span.offset != expected {
                return Err(CoverageError::Discontinuity {
                    name: leaf.name.clone(),
                    expected,
                    found: span.offset,
                });
            }
            expected = span
                .checked_end()
                .ok_or_else(|| CoverageError::Overflow { name: leaf.name.clone() })?;
        }
        if expected != self.length {
            return Err(CoverageError::Incomplete {
                covered: expected,
                length: self.length,
            });
        }
        Ok(())
    }

    /// Check every leaf's value against its span, nested trees included:
    /// spans must not overflow, and kept bytes or zero runs must be exactly
    /// as long as the span they stand for
    pub fn verify_values(&self) -> Result<(), CoverageError> {
        self.tokens.iter().try_for_each(Token::verify_value)
    }

    /// Concatenate the bytes of `source` named by each leaf span
    ///
    /// Returns `None` if a leaf has no span or points outside `source`.
    pub fn reconstruct_from(&self, source: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(source.len().min(usize::try_from(self.length).unwrap_or(usize::MAX)));
        for leaf in self.leaves() {
            let span = leaf.span?;
            let start = usize::try_from(span.offset).ok()?;
            let end = usize::try_from(span.checked_end()?).ok()?;
            out.extend_from_slice(source.get(start..end)?);
        }
        Some(out)
    }

    /// Rebuild the archive bytes from the tree alone
    ///
    /// Only possible when the leaves tile the archive and every leaf kept
    /// its bytes (see `LoaderConfig::inline_payload_limit`), is a zero run,
    /// or holds a nested tokenization of exactly its span that can be
    /// rebuilt. Returns `None` otherwise, or when the archive does not fit
    /// in memory.
    pub fn rebuild(&self) -> Option<Vec<u8>> {
        self.verify_coverage().ok()?;
        self.verify_values().ok()?;
        let mut out = Vec::new();
        for leaf in self.leaves() {
            let len = usize::try_from(leaf.span?.length).ok()?;
            out.try_reserve(len).ok()?;
            match (leaf.leaf_bytes(), &leaf.value, &leaf.nested) {
                (Some(bytes), _, _) => out.extend_from_slice(bytes),
                (None, TokenValue::Zeros(_), _) => out.resize(out.len() + len, 0),
                (None, _, Some(nested)) if nested.length == leaf.span?.length => out.extend(nested.rebuild()?),
                (None, _, _) => return None,
            }
        }
        Some(out)
    }

    /// Names of all payload tokens of this archive (nested archives excluded)
    pub fn payload_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for token in &self.tokens {
            token.collect_payload_names(&mut out);
        }
        out
    }

    /// Whether a payload with exactly this name exists
    pub fn has_root_payload(&self, name: &str) -> bool {
        self.payload_names().iter().any(|n| *n == name)
    }

    /// All nested tokenizations, depth-first, with their nesting depth
    /// (direct children are depth 1)
    pub fn nested_archives(&self) -> Vec<(usize, &ArchiveTokenization)> {
        let mut out = Vec::new();
        self.collect_nested(1, &mut out);
        out
    }

    /// First nested tokenization of the given type, with its depth
    pub fn find_nested(&self, archive_type: &str) -> Option<(usize, &ArchiveTokenization)> {
        self.nested_archives()
            .into_iter()
            .find(|(_, t)| t.archive_type == archive_type)
    }

    fn collect_nested<'a>(&'a self, depth: usize, out: &mut Vec<(usize, &'a ArchiveTokenization)>) {
        for token in &self.tokens {
            token.collect_nested(depth, out);
        }
    }
}

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(data: T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| {
            base64::engine::general_purpose::STANDARD
                .decode(t.as_bytes())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
