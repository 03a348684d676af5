//! SWUpdate packages
//!
//! A `.swu` package is an ordinary cpio (or tar) archive whose top level
//! holds a `sw-description` entry, optionally signed by
//! `sw-description.sig`. The package is tokenized by asking the loader for
//! the container underneath; the result is a single `Container` leaf over
//! the whole package with the container's tokenization nested in it.

use crate::archive::{ArchiveTokenization, Span, Token, TokenKind, TokenValue};
use crate::error::Result;
use crate::formats::{self, FormatParser};
use crate::loader::ParseContext;
use crate::stream::SubStream;

const FORMAT: &str = "swupdate";
const CONTAINER_TYPES: [&str; 2] = ["cpio", "tar"];
const DESCRIPTION: &str = "sw-description";
const SIGNATURE: &str = "sw-description.sig";

#[derive(Debug, Clone, Copy, Default)]
pub struct SwUpdateParser;

impl FormatParser for SwUpdateParser {
    fn name(&self) -> &'static str {
        "swupdate"
    }

    fn archive_type(&self) -> &'static str {
        FORMAT
    }

    fn try_parse(&self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
        // The container sits one level deeper than the package itself
        if ctx.depth() >= ctx.config().max_depth {
            tracing::debug!(depth = ctx.depth(), "no depth left for an SWUpdate container");
            return Ok(None);
        }

        let Some(inner) = ctx.load_nested(stream, Some(0), &CONTAINER_TYPES)? else {
            return Ok(None);
        };
        if !inner.has_root_payload(DESCRIPTION) {
            tracing::debug!(container = inner.archive_type(), "container has no {}", DESCRIPTION);
            return Ok(None);
        }

        let subtype = format!("{}.{}", inner.archive_type(), inner.subtype());
        tracing::debug!(
            subtype = %subtype,
            signed = inner.has_root_payload(SIGNATURE),
            "SWUpdate package"
        );

        let container = Token::leaf(
            TokenKind::Container,
            inner.archive_type(),
            TokenValue::Sha256(inner.sha256().to_string()),
            Span::new(0, inner.length()),
        )
        .with_nested(inner);

        formats::finish(stream, FORMAT, &subtype, vec![container]).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{ArchiveLoader, LoaderConfig};
    use crate::registry::FormatRegistry;
    use crate::formats::cpio::NewAsciiCpioParser;
    use crate::loader::NestedDetection;
    use crate::scratch::DirScratch;
    use crate::stream::SubStream;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts how often the wrapped parser actually runs
    struct Counting<P> {
        inner: P,
        calls: Arc<AtomicUsize>,
    }

    impl<P: FormatParser> FormatParser for Counting<P> {
        fn name(&self) -> &'static str {
            self.inner.name()
        }

        fn archive_type(&self) -> &'static str {
            self.inner.archive_type()
        }

        fn try_parse(&self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.try_parse(stream, ctx)
        }
    }

    fn counting_load(data: Vec<u8>, config: LoaderConfig) -> (ArchiveTokenization, usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = FormatRegistry::new();
        registry.register(SwUpdateParser, 102).unwrap();
        registry.register(Counting { inner: NewAsciiCpioParser, calls: calls.clone() }, 101).unwrap();
        let loader = ArchiveLoader::new(&registry, config);
        let mut cursor = Cursor::new(data);
        let tokens = loader.try_load_archive(&mut cursor, &DirScratch::system_temp(), None).unwrap().unwrap();
        (tokens, calls.load(Ordering::SeqCst))
    }

    fn newc(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let trailer: (&str, &[u8]) = ("TRAILER!!!", b"");
        for (name, data) in entries.iter().chain(std::iter::once(&trailer)) {
            let mode = if *name == "TRAILER!!!" { 0 } else { 0o100644 };
            let values = [1, mode, 0, 0, 1, 0, data.len(), 0, 0, 0, 0, name.len() + 1, 0];
            out.extend_from_slice(b"070701");
            for v in values {
                out.extend_from_slice(format!("{:08X}", v).as_bytes());
            }
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.resize(out.len().next_multiple_of(4), 0);
            out.extend_from_slice(data);
            out.resize(out.len().next_multiple_of(4), 0);
        }
        out
    }

    fn load(data: Vec<u8>, config: LoaderConfig) -> Result<Option<ArchiveTokenization>> {
        let registry = FormatRegistry::with_standard_formats();
        let loader = ArchiveLoader::new(&registry, config);
        let mut cursor = Cursor::new(data);
        loader.try_load_archive(&mut cursor, &DirScratch::system_temp(), None)
    }

    #[test]
    fn test_package_wraps_container() {
        let data = newc(&[("sw-description", b"software = {};"), ("sw-description.sig", b"sig"), ("app.bin", b"app")]);
        let tokens = load(data.clone(), LoaderConfig::default()).unwrap().unwrap();

        assert_eq!(tokens.archive_type(), "swupdate");
        assert_eq!(tokens.subtype(), "cpio.new-ascii");
        assert_eq!(tokens.length(), data.len() as u64);
        tokens.verify_coverage().unwrap();

        let container = &tokens.tokens()[0];
        assert_eq!(container.kind, TokenKind::Container);
        let inner = container.nested.as_deref().unwrap();
        assert_eq!(inner.payload_names(), vec!["sw-description", "sw-description.sig", "app.bin"]);
        assert_eq!(inner.sha256(), tokens.sha256());
    }

    #[test]
    fn test_container_without_description_is_plain_cpio() {
        let data = newc(&[("readme", b"hi")]);
        let tokens = load(data, LoaderConfig::default()).unwrap().unwrap();
        assert_eq!(tokens.archive_type(), "cpio");
    }

    #[test]
    fn test_nested_description_does_not_count() {
        let data = newc(&[("dir/sw-description", b"x")]);
        let tokens = load(data, LoaderConfig::default()).unwrap().unwrap();
        assert_eq!(tokens.archive_type(), "cpio");
    }

    #[test]
    fn test_no_depth_left_declines() {
        let data = newc(&[("sw-description", b"x")]);
        let tokens = load(data, LoaderConfig::default().with_max_depth(0)).unwrap().unwrap();
        assert_eq!(tokens.archive_type(), "cpio");
    }

    #[test]
    fn test_container_parse_is_reused_by_plain_candidate() {
        let data = newc(&[("readme", b"hi")]);
        let (tokens, calls) = counting_load(data.clone(), LoaderConfig::default());
        assert_eq!(tokens.archive_type(), "cpio");
        assert_eq!(tokens.length(), data.len() as u64);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_sniffed_payloads_are_parsed_once() {
        let inner = newc(&[("x", b"inner data")]);
        let data = newc(&[("blob", &inner)]);
        let config = LoaderConfig::default().with_nested(NestedDetection::Sniff);

        let (tokens, calls) = counting_load(data, config);
        assert_eq!(tokens.archive_type(), "cpio");
        let (depth, nested) = tokens.find_nested("cpio").unwrap();
        assert_eq!(depth, 1);
        assert_eq!(nested.payload_names(), vec!["x"]);
        // one parse per distinct region: the archive, "blob" and "x"
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_rebuild_through_container() {
        let data = newc(&[("sw-description", b"software = {};")]);
        let config = LoaderConfig::default().with_inline_payload_limit(4096);
        let tokens = load(data.clone(), config).unwrap().unwrap();
        assert_eq!(tokens.rebuild().unwrap(), data);
    }
}
