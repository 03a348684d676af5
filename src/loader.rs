//! Archive detection
//!
//! # Algorithm
//! - Resolve candidates from the [`FormatRegistry`] (all, or those matching a hint).
//! - Try each in order against a view of the stream that starts at the
//!   caller's current position; the first parser that accepts wins.
//! - A decline or a recoverable error moves on to the next candidate; any
//!   other error stops detection and is returned as is.
//!
//! # Stream position
//! The position of the stream when `try_load_archive` is called is the start
//! of the archive. Every attempt runs under a [`StreamCheckpoint`], so after a
//! decline, an error, or an overall "no format matched" the stream is back at
//! that position and the same stream can be tried again (for example with a
//! hint first and without one afterwards). After a success the stream is left
//! just past the bytes the tokenization covers.
//!
//! A stream must not be handed to two detections at the same time.
//!
//! # Reuse
//! One top-level load remembers every parser outcome, tokenization or
//! decline, keyed by the absolute extent parsed and the parser. A region
//! parsed once (the container underneath an SWUpdate candidate, a payload
//! sniffed with every format) is not parsed again when a later candidate
//! asks for the same parser over the same bytes.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::{Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::archive::ArchiveTokenization;
use crate::error::{ArchiveError, Result};
use crate::registry::{FormatDescriptor, FormatRegistry};
use crate::scratch::ScratchSpace;
use crate::stream::{ReadSeek, StreamCheckpoint, SubStream};

/// How payloads are selected for nested archive detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NestedDetection {
    /// Only payloads whose name carries a known archive extension, checked
    /// with the matching type
    #[default]
    ByExtension,
    /// Every payload, checked against every registered format
    Sniff,
    /// Never look inside payloads
    Disabled,
}

/// Cooperative cancellation flag shared between a caller and a running load
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Loader settings
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Deepest allowed nesting of archives inside archives
    pub max_depth: usize,
    /// Payload and gap leaves up to this size keep their bytes in the tree
    pub inline_payload_limit: u64,
    /// Nested archive selection
    pub nested: NestedDetection,
    /// Optional cancellation flag
    pub cancel: Option<CancelToken>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            inline_payload_limit: 0,
            nested: NestedDetection::ByExtension,
            cancel: None,
        }
    }
}

impl LoaderConfig {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_inline_payload_limit(mut self, limit: u64) -> Self {
        self.inline_payload_limit = limit;
        self
    }

    pub fn with_nested(mut self, nested: NestedDetection) -> Self {
        self.nested = nested;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Map an entry name to the archive type its extension implies
pub fn nested_type_for_name(name: &str) -> Option<&'static str> {
    const EXTENSIONS: &[(&str, &str)] = &[
        (".ext4", "ext4"),
        (".ext3", "ext4"),
        (".ext2", "ext4"),
        (".tar", "tar"),
        (".cpio", "cpio"),
        (".swu", "swupdate"),
    ];
    let lower = name.to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(ext, _)| lower.ends_with(ext))
        .map(|(_, archive_type)| *archive_type)
}

/// Absolute start, length and parser name of a parsed region
type CacheKey = (u64, u64, &'static str);

/// Parser outcomes (tokenization or decline) seen during one top-level load
#[derive(Default)]
struct TokenCache {
    /// Outcome and the depth it was produced at
    entries: RefCell<HashMap<CacheKey, (usize, Option<ArchiveTokenization>)>>,
    /// Deepest nesting level entered by the parse in progress
    deepest: Cell<usize>,
    hits: Cell<usize>,
}

impl TokenCache {
    /// An outcome produced at `depth` or deeper holds here too, since only
    /// parses that never reached the depth limit are kept
    fn get(&self, key: &CacheKey, depth: usize) -> Option<Option<ArchiveTokenization>> {
        let entries = self.entries.borrow();
        let (parsed_at, outcome) = entries.get(key).filter(|(parsed_at, _)| *parsed_at >= depth)?;
        tracing::debug!(
            parser = key.2,
            offset = key.0,
            parsed_at,
            depth,
            accepted = outcome.is_some(),
            "reusing earlier parse"
        );
        self.hits.set(self.hits.get() + 1);
        Some(outcome.clone())
    }

    fn insert(&self, key: CacheKey, depth: usize, outcome: &Option<ArchiveTokenization>) {
        self.entries.borrow_mut().insert(key, (depth, outcome.clone()));
    }
}

/// Detection entry point bound to a registry and a configuration
pub struct ArchiveLoader<'r> {
    registry: &'r FormatRegistry,
    config: LoaderConfig,
}

impl ArchiveLoader<'static> {
    /// Loader over the process-wide standard registry
    pub fn standard() -> Self {
        Self::new(FormatRegistry::standard(), LoaderConfig::default())
    }
}

impl<'r> ArchiveLoader<'r> {
    pub fn new(registry: &'r FormatRegistry, config: LoaderConfig) -> Self {
        Self { registry, config }
    }

    pub fn with_config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn registry(&self) -> &FormatRegistry {
        self.registry
    }

    /// Detect and tokenize the archive starting at the stream's position.
    ///
    /// Returns `Ok(None)` when no candidate accepts the stream. A `hint`
    /// restricts candidates to that archive type and fails with
    /// [`ArchiveError::UnknownFormatHint`] before any parsing when nothing
    /// is registered under it.
    pub fn try_load_archive(
        &self,
        stream: &mut dyn ReadSeek,
        scratch: &dyn ScratchSpace,
        hint: Option<&str>,
    ) -> Result<Option<ArchiveTokenization>> {
        let candidates = self.registry.candidates_for(hint)?;
        self.run_top(stream, scratch, &candidates)
    }

    /// Like [`ArchiveLoader::try_load_archive`] with several acceptable types
    pub fn try_load_archive_any(
        &self,
        stream: &mut dyn ReadSeek,
        scratch: &dyn ScratchSpace,
        types: &[&str],
    ) -> Result<Option<ArchiveTokenization>> {
        let candidates = self.registry.candidates_for_any(types)?;
        self.run_top(stream, scratch, &candidates)
    }

    fn run_top(
        &self,
        stream: &mut dyn ReadSeek,
        scratch: &dyn ScratchSpace,
        candidates: &[&FormatDescriptor],
    ) -> Result<Option<ArchiveTokenization>> {
        let cache = TokenCache::default();
        let result = self.run(stream, scratch, candidates, 0, Some(0), &cache);
        tracing::trace!(
            parsed = cache.entries.borrow().len(),
            reused = cache.hits.get(),
            "archive load finished"
        );
        result
    }

    /// Try `candidates` on `stream` at `depth`. `origin` is the absolute
    /// offset of the stream's byte 0, when it maps onto the caller's stream.
    fn run(
        &self,
        stream: &mut dyn ReadSeek,
        scratch: &dyn ScratchSpace,
        candidates: &[&FormatDescriptor],
        depth: usize,
        origin: Option<u64>,
        cache: &TokenCache,
    ) -> Result<Option<ArchiveTokenization>> {
        if depth > self.config.max_depth {
            return Err(ArchiveError::DepthExceeded { depth });
        }
        cache.deepest.set(cache.deepest.get().max(depth));

        let mut checkpoint = StreamCheckpoint::new(stream)?;
        let start = checkpoint.position();
        let origin = origin.map(|o| o + start);
        let ctx = ParseContext { loader: self, scratch, depth, origin, cache };

        for descriptor in candidates {
            ctx.check_cancelled()?;
            checkpoint.restore()?;

            tracing::debug!(
                parser = descriptor.name(),
                archive_type = descriptor.archive_type(),
                priority = descriptor.priority(),
                depth,
                "testing archive format"
            );

            let outcome = {
                let mut view = SubStream::from_current(checkpoint.stream())?;
                let key = origin.map(|o| (o, view.len(), descriptor.name()));
                match key.and_then(|key| cache.get(&key, depth)) {
                    Some(outcome) => Ok(outcome),
                    None => {
                        let outer_deepest = cache.deepest.replace(depth);
                        let outcome = descriptor.parser().try_parse(&mut view, &ctx);
                        let reached = cache.deepest.get();
                        cache.deepest.set(outer_deepest.max(reached));
                        if let (Some(key), Ok(parsed)) = (key, &outcome) {
                            if reached < self.config.max_depth {
                                cache.insert(key, depth, parsed);
                            }
                        }
                        outcome
                    }
                }
            };

            match outcome {
                Ok(Some(tokens)) => {
                    tracing::info!(
                        archive_type = tokens.archive_type(),
                        subtype = tokens.subtype(),
                        length = tokens.length(),
                        depth,
                        "archive format detected"
                    );
                    checkpoint.stream().seek(SeekFrom::Start(start + tokens.length()))?;
                    checkpoint.commit();
                    return Ok(Some(tokens));
                }
                Ok(None) => {
                    tracing::debug!(parser = descriptor.name(), depth, "archive is not of this format");
                }
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(parser = descriptor.name(), depth, error = %e, "format attempt abandoned");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }
}

/// What a parser may use while tokenizing
pub struct ParseContext<'a> {
    loader: &'a ArchiveLoader<'a>,
    scratch: &'a dyn ScratchSpace,
    depth: usize,
    /// Absolute offset of the parser's view in the caller's stream
    origin: Option<u64>,
    cache: &'a TokenCache,
}

impl<'a> ParseContext<'a> {
    pub fn config(&self) -> &LoaderConfig {
        &self.loader.config
    }

    pub fn scratch(&self) -> &dyn ScratchSpace {
        self.scratch
    }

    /// Nesting depth of the archive being parsed (0 for the outermost)
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Fail with [`ArchiveError::Cancelled`] once the caller cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        match &self.loader.config.cancel {
            Some(token) if token.is_cancelled() => Err(ArchiveError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Archive type to look for in an entry called `name`, per the nested
    /// detection policy. `Some(None)` means "try everything".
    pub fn nested_type_for(&self, name: &str) -> Option<Option<&'static str>> {
        match self.loader.config.nested {
            NestedDetection::Disabled => None,
            NestedDetection::Sniff => Some(None),
            NestedDetection::ByExtension => nested_type_for_name(name).map(Some),
        }
    }

    /// Absolute offset in the caller's stream of `offset` in the parser's
    /// view, when the view maps onto that stream
    pub fn absolute_offset(&self, offset: u64) -> Option<u64> {
        self.origin.map(|o| o + offset)
    }

    /// Run detection one level deeper on `stream`, restricted to `types`
    /// (all registered formats when `types` is empty). Types unknown to the
    /// registry are ignored.
    ///
    /// `at` is the offset in the parser's view where `stream` begins, or
    /// `None` when `stream` holds bytes assembled elsewhere (a fragmented
    /// file copied to scratch space). Only regions with a known offset take
    /// part in tokenization reuse.
    pub fn load_nested(
        &self,
        stream: &mut dyn ReadSeek,
        at: Option<u64>,
        types: &[&str],
    ) -> Result<Option<ArchiveTokenization>> {
        let candidates = if types.is_empty() {
            self.loader.registry.candidates_for(None)?
        } else {
            self.loader.registry.candidates_matching(types)
        };
        if candidates.is_empty() {
            return Ok(None);
        }
        let origin = at.and_then(|at| self.absolute_offset(at));
        self.loader
            .run(stream, self.scratch, &candidates, self.depth + 1, origin, self.cache)
    }

    /// Nested detection on the data of entry `entry`.
    ///
    /// Unlike [`ParseContext::load_nested`], a payload that looks like an
    /// archive but turns out malformed is not an error of the outer archive:
    /// it is logged and the payload stays opaque data.
    pub fn detect_in_entry(
        &self,
        entry: &str,
        stream: &mut dyn ReadSeek,
        at: Option<u64>,
        types: &[&str],
    ) -> Result<Option<ArchiveTokenization>> {
        match self.load_nested(stream, at, types) {
            Err(ArchiveError::Malformed { format, subtype, offset, reason }) => {
                let absolute = at.and_then(|at| self.absolute_offset(at + offset));
                tracing::warn!(
                    entry,
                    format = %format,
                    subtype = %subtype,
                    offset,
                    absolute_offset = ?absolute,
                    reason = %reason,
                    "entry data looks like an archive but is malformed, kept as payload"
                );
                Ok(None)
            }
            other => other,
        }
    }
}

/// Detect and tokenize using the standard registry and default settings
pub fn try_load_archive(
    stream: &mut dyn ReadSeek,
    scratch: &dyn ScratchSpace,
    hint: Option<&str>,
) -> Result<Option<ArchiveTokenization>> {
    ArchiveLoader::standard().try_load_archive(stream, scratch, hint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Span, Token, TokenKind, TokenValue};
    use crate::formats::FormatParser;
    use crate::scratch::DirScratch;
    use std::io::{Cursor, Read};

    /// Accepts streams starting with its tag and consumes exactly the tag
    struct TagParser {
        name: &'static str,
        archive_type: &'static str,
        tag: &'static [u8],
        outcome: Outcome,
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Accept,
        Recoverable,
        Malformed,
    }

    impl FormatParser for TagParser {
        fn name(&self) -> &'static str {
            self.name
        }

        fn archive_type(&self) -> &'static str {
            self.archive_type
        }

        fn try_parse(
            &self,
            stream: &mut SubStream<'_>,
            _ctx: &ParseContext<'_>,
        ) -> Result<Option<ArchiveTokenization>> {
            let mut buf = vec![0u8; self.tag.len()];
            if crate::stream::read_up_to(stream, &mut buf)? != buf.len() || buf != self.tag {
                return Ok(None);
            }
            match self.outcome {
                Outcome::Accept => {
                    let leaf = Token::leaf(
                        TokenKind::Payload,
                        "tag",
                        TokenValue::None,
                        Span::new(0, self.tag.len() as u64),
                    );
                    Ok(Some(ArchiveTokenization::new(
                        self.archive_type,
                        self.name,
                        self.tag.len() as u64,
                        "",
                        vec![leaf],
                    )))
                }
                Outcome::Recoverable => Err(ArchiveError::Recoverable {
                    format: self.archive_type.into(),
                    reason: "gave up".into(),
                }),
                Outcome::Malformed => Err(ArchiveError::malformed(self.archive_type, self.name, 0, "bad")),
            }
        }
    }

    fn tag(name: &'static str, archive_type: &'static str, tag: &'static [u8], outcome: Outcome) -> TagParser {
        TagParser { name, archive_type, tag, outcome }
    }

    fn scratch() -> DirScratch {
        DirScratch::system_temp()
    }

    #[test]
    fn test_higher_priority_wins() {
        let mut registry = FormatRegistry::new();
        registry.register(tag("low", "x", b"AB", Outcome::Accept), 1).unwrap();
        registry.register(tag("high", "x", b"AB", Outcome::Accept), 5).unwrap();
        let loader = ArchiveLoader::new(&registry, LoaderConfig::default());

        let mut stream = Cursor::new(b"AB".to_vec());
        let tokens = loader.try_load_archive(&mut stream, &scratch(), None).unwrap().unwrap();
        assert_eq!(tokens.subtype(), "high");
    }

    #[test]
    fn test_equal_priority_registration_order_wins() {
        for _ in 0..3 {
            let mut registry = FormatRegistry::new();
            registry.register(tag("first", "x", b"AB", Outcome::Accept), 7).unwrap();
            registry.register(tag("second", "x", b"AB", Outcome::Accept), 7).unwrap();
            let loader = ArchiveLoader::new(&registry, LoaderConfig::default());

            let mut stream = Cursor::new(b"AB".to_vec());
            let tokens = loader.try_load_archive(&mut stream, &scratch(), None).unwrap().unwrap();
            assert_eq!(tokens.subtype(), "first");
        }
    }

    #[test]
    fn test_no_match_restores_position() {
        let mut registry = FormatRegistry::new();
        registry.register(tag("a", "x", b"ZZ", Outcome::Accept), 1).unwrap();
        let loader = ArchiveLoader::new(&registry, LoaderConfig::default());

        let mut stream = Cursor::new(b"..AB".to_vec());
        stream.seek(SeekFrom::Start(2)).unwrap();
        assert!(loader.try_load_archive(&mut stream, &scratch(), None).unwrap().is_none());
        assert_eq!(stream.position(), 2);
    }

    #[test]
    fn test_archive_starts_at_current_position() {
        let mut registry = FormatRegistry::new();
        registry.register(tag("a", "x", b"AB", Outcome::Accept), 1).unwrap();
        let loader = ArchiveLoader::new(&registry, LoaderConfig::default());

        let mut stream = Cursor::new(b"..ABrest".to_vec());
        stream.seek(SeekFrom::Start(2)).unwrap();
        let tokens = loader.try_load_archive(&mut stream, &scratch(), None).unwrap().unwrap();
        assert_eq!(tokens.length(), 2);
        assert_eq!(stream.position(), 4);
        let mut rest = String::new();
        stream.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "rest");
    }

    #[test]
    fn test_hint_then_full_detection_on_same_stream() {
        let mut registry = FormatRegistry::new();
        registry.register(tag("c", "cpio", b"CP", Outcome::Accept), 1).unwrap();
        registry.register(tag("t", "tar", b"TA", Outcome::Accept), 1).unwrap();
        let loader = ArchiveLoader::new(&registry, LoaderConfig::default());

        let mut stream = Cursor::new(b"TA".to_vec());
        assert!(loader.try_load_archive(&mut stream, &scratch(), Some("cpio")).unwrap().is_none());
        let tokens = loader.try_load_archive(&mut stream, &scratch(), None).unwrap().unwrap();
        assert_eq!(tokens.archive_type(), "tar");
    }

    #[test]
    fn test_recoverable_error_falls_through() {
        let mut registry = FormatRegistry::new();
        registry.register(tag("flaky", "x", b"AB", Outcome::Recoverable), 9).unwrap();
        registry.register(tag("solid", "y", b"AB", Outcome::Accept), 1).unwrap();
        let loader = ArchiveLoader::new(&registry, LoaderConfig::default());

        let mut stream = Cursor::new(b"AB".to_vec());
        let tokens = loader.try_load_archive(&mut stream, &scratch(), None).unwrap().unwrap();
        assert_eq!(tokens.archive_type(), "y");
    }

    #[test]
    fn test_malformed_stops_detection() {
        let mut registry = FormatRegistry::new();
        registry.register(tag("broken", "x", b"AB", Outcome::Malformed), 9).unwrap();
        registry.register(tag("solid", "y", b"AB", Outcome::Accept), 1).unwrap();
        let loader = ArchiveLoader::new(&registry, LoaderConfig::default());

        let mut stream = Cursor::new(b"AB".to_vec());
        let err = loader.try_load_archive(&mut stream, &scratch(), None).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed { .. }));
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn test_unknown_hint_fails_before_parsing() {
        let mut registry = FormatRegistry::new();
        registry.register(tag("broken", "x", b"AB", Outcome::Malformed), 9).unwrap();
        let loader = ArchiveLoader::new(&registry, LoaderConfig::default());

        let mut stream = Cursor::new(b"AB".to_vec());
        let err = loader.try_load_archive(&mut stream, &scratch(), Some("zip")).unwrap_err();
        assert!(matches!(err, ArchiveError::UnknownFormatHint { .. }));
    }

    #[test]
    fn test_cancelled_before_first_candidate() {
        let mut registry = FormatRegistry::new();
        registry.register(tag("a", "x", b"AB", Outcome::Accept), 1).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let loader = ArchiveLoader::new(&registry, LoaderConfig::default().with_cancel(cancel));

        let mut stream = Cursor::new(b"AB".to_vec());
        let err = loader.try_load_archive(&mut stream, &scratch(), None).unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
    }

    #[test]
    fn test_nested_type_for_name() {
        assert_eq!(nested_type_for_name("rootfs.EXT4"), Some("ext4"));
        assert_eq!(nested_type_for_name("image.ext2"), Some("ext4"));
        assert_eq!(nested_type_for_name("data/inner.tar"), Some("tar"));
        assert_eq!(nested_type_for_name("initrd.cpio"), Some("cpio"));
        assert_eq!(nested_type_for_name("update.swu"), Some("swupdate"));
        assert_eq!(nested_type_for_name("notes.txt"), None);
    }
}
