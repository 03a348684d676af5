//! Format registry
//!
//! An append-only catalog of [`FormatParser`]s. Each entry carries a
//! priority; candidates come back ordered by descending priority and, for
//! equal priorities, by registration order, so detection is reproducible.
//!
//! Registration takes `&mut self`. Hosts that register from several threads
//! put the registry behind a `Mutex` for the setup phase and move it out
//! afterwards; lookups on a finished registry need no locking.

use std::sync::OnceLock;

use crate::error::{ArchiveError, Result};
use crate::formats::cpio::{AsciiCpioParser, BinaryCpioParser, NewAsciiCpioParser};
use crate::formats::ext4::Ext4Parser;
use crate::formats::swupdate::SwUpdateParser;
use crate::formats::tar::OldStyleTarParser;
use crate::formats::FormatParser;

/// A registered parser and its priority
pub struct FormatDescriptor {
    parser: Box<dyn FormatParser>,
    priority: i32,
    order: usize,
}

impl FormatDescriptor {
    pub fn name(&self) -> &'static str {
        self.parser.name()
    }

    pub fn archive_type(&self) -> &'static str {
        self.parser.archive_type()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn parser(&self) -> &dyn FormatParser {
        self.parser.as_ref()
    }
}

impl std::fmt::Debug for FormatDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatDescriptor")
            .field("name", &self.name())
            .field("archive_type", &self.archive_type())
            .field("priority", &self.priority)
            .field("order", &self.order)
            .finish()
    }
}

/// Ordered catalog of known formats
#[derive(Debug, Default)]
pub struct FormatRegistry {
    /// Kept sorted by (priority desc, registration order asc)
    descriptors: Vec<FormatDescriptor>,
    registered: usize,
}

impl FormatRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in format
    pub fn with_standard_formats() -> Self {
        let mut registry = Self::new();
        // Built-in names are distinct and the registry starts empty
        for (parser, priority) in standard_formats() {
            registry.insert(parser, priority);
        }
        registry
    }

    /// Process-wide registry of the built-in formats, built on first use
    pub fn standard() -> &'static FormatRegistry {
        static STANDARD: OnceLock<FormatRegistry> = OnceLock::new();
        STANDARD.get_or_init(FormatRegistry::with_standard_formats)
    }

    /// Add a parser under `priority`
    ///
    /// Fails with [`ArchiveError::DuplicateRegistration`] if a parser with
    /// the same name is already registered.
    pub fn register(&mut self, parser: impl FormatParser + 'static, priority: i32) -> Result<()> {
        self.register_boxed(Box::new(parser), priority)
    }

    pub fn register_boxed(&mut self, parser: Box<dyn FormatParser>, priority: i32) -> Result<()> {
        let name = parser.name();
        if self.descriptors.iter().any(|d| d.name() == name) {
            return Err(ArchiveError::DuplicateRegistration { name: name.to_string() });
        }

        self.insert(parser, priority);
        Ok(())
    }

    fn insert(&mut self, parser: Box<dyn FormatParser>, priority: i32) {
        tracing::debug!(
            parser = parser.name(),
            archive_type = parser.archive_type(),
            priority,
            "registered archive format"
        );

        let order = self.registered;
        self.registered += 1;
        self.descriptors.push(FormatDescriptor { parser, priority, order });
        self.descriptors
            .sort_by_key(|d| (std::cmp::Reverse(d.priority), d.order));
    }

    /// All descriptors in detection order
    pub fn descriptors(&self) -> &[FormatDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Distinct archive types, in detection order
    pub fn archive_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = Vec::new();
        for d in &self.descriptors {
            if !types.contains(&d.archive_type()) {
                types.push(d.archive_type());
            }
        }
        types
    }

    /// Candidates for an optional type hint
    ///
    /// No hint (or an empty one) yields every descriptor. A hint is matched
    /// exactly and case-sensitively against each parser's archive type.
    pub fn candidates_for(&self, hint: Option<&str>) -> Result<Vec<&FormatDescriptor>> {
        match hint {
            None | Some("") => Ok(self.descriptors.iter().collect()),
            Some(hint) => {
                let found = self.candidates_matching(&[hint]);
                if found.is_empty() {
                    return Err(ArchiveError::UnknownFormatHint { hint: hint.to_string() });
                }
                Ok(found)
            }
        }
    }

    /// Candidates whose type is any of `types`
    ///
    /// Fails if none match; use an empty slice for "all".
    pub fn candidates_for_any(&self, types: &[&str]) -> Result<Vec<&FormatDescriptor>> {
        if types.is_empty() {
            return self.candidates_for(None);
        }
        let found = self.candidates_matching(types);
        if found.is_empty() {
            return Err(ArchiveError::UnknownFormatHint { hint: types.join(",") });
        }
        Ok(found)
    }

    pub(crate) fn candidates_matching(&self, types: &[&str]) -> Vec<&FormatDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| types.contains(&d.archive_type()))
            .collect()
    }
}

/// Built-in parsers with their standard priorities, in registration order.
///
/// SWUpdate comes first because every SWUpdate package is also a valid cpio
/// or tar archive; new-ascii cpio precedes the remaining formats.
fn standard_formats() -> [(Box<dyn FormatParser>, i32); 6] {
    [
        (Box::new(SwUpdateParser), 102),
        (Box::new(NewAsciiCpioParser), 101),
        (Box::new(OldStyleTarParser), 100),
        (Box::new(AsciiCpioParser), 100),
        (Box::new(BinaryCpioParser), 100),
        (Box::new(Ext4Parser), 100),
    ]
}

/// Register every built-in format with its standard priority
pub fn register_standard_formats(registry: &mut FormatRegistry) -> Result<()> {
    for (parser, priority) in standard_formats() {
        registry.register_boxed(parser, priority)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveTokenization;
    use crate::loader::ParseContext;
    use crate::stream::SubStream;
    use std::sync::Mutex;

    struct Named(&'static str, &'static str);

    impl FormatParser for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn archive_type(&self) -> &'static str {
            self.1
        }

        fn try_parse(&self, _: &mut SubStream<'_>, _: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
            Ok(None)
        }
    }

    fn names(found: &[&FormatDescriptor]) -> Vec<&'static str> {
        found.iter().map(|d| d.name()).collect()
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = FormatRegistry::new();
        registry.register(Named("a", "cpio"), 1).unwrap();
        let err = registry.register(Named("a", "cpio"), 2).unwrap_err();
        assert!(matches!(err, ArchiveError::DuplicateRegistration { ref name } if name == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_candidates_ordered_by_priority_then_registration() {
        let mut registry = FormatRegistry::new();
        registry.register(Named("a", "tar"), 10).unwrap();
        registry.register(Named("b", "cpio"), 20).unwrap();
        registry.register(Named("c", "cpio"), 10).unwrap();
        registry.register(Named("d", "ext4"), 20).unwrap();

        let all = registry.candidates_for(None).unwrap();
        assert_eq!(names(&all), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_hint_filters_exactly() {
        let mut registry = FormatRegistry::new();
        registry.register(Named("a", "tar"), 10).unwrap();
        registry.register(Named("b", "cpio"), 20).unwrap();
        registry.register(Named("c", "cpio"), 30).unwrap();

        assert_eq!(names(&registry.candidates_for(Some("cpio")).unwrap()), vec!["c", "b"]);
        assert_eq!(names(&registry.candidates_for(Some("")).unwrap()), vec!["c", "b", "a"]);
        assert!(matches!(
            registry.candidates_for(Some("CPIO")),
            Err(ArchiveError::UnknownFormatHint { .. })
        ));
    }

    #[test]
    fn test_candidates_for_any() {
        let mut registry = FormatRegistry::new();
        registry.register(Named("a", "tar"), 10).unwrap();
        registry.register(Named("b", "cpio"), 20).unwrap();
        registry.register(Named("c", "ext4"), 30).unwrap();

        assert_eq!(names(&registry.candidates_for_any(&["cpio", "tar"]).unwrap()), vec!["b", "a"]);
        assert!(registry.candidates_for_any(&["zip"]).is_err());
        assert!(registry.candidates_matching(&["zip"]).is_empty());
    }

    #[test]
    fn test_standard_registry_contents() {
        let registry = FormatRegistry::standard();
        assert_eq!(registry.len(), 6);
        let order: Vec<&str> = registry.descriptors().iter().map(|d| d.name()).collect();
        assert_eq!(
            order,
            vec!["swupdate", "new-ascii-cpio", "old-style-tar", "ascii-cpio", "binary-cpio", "ext4"]
        );
        assert_eq!(registry.archive_types(), vec!["swupdate", "cpio", "tar", "ext4"]);
    }

    #[test]
    fn test_standard_formats_have_distinct_names() {
        let mut names: Vec<&str> = standard_formats().iter().map(|(p, _)| p.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), standard_formats().len());

        let mut registry = FormatRegistry::new();
        register_standard_formats(&mut registry).unwrap();
        let checked: Vec<&str> = registry.descriptors().iter().map(|d| d.name()).collect();
        let direct: Vec<&str> = FormatRegistry::with_standard_formats().descriptors().iter().map(|d| d.name()).collect();
        assert_eq!(checked, direct);
    }

    #[test]
    fn test_standard_registration_twice_is_rejected() {
        let mut registry = FormatRegistry::with_standard_formats();
        assert!(matches!(
            register_standard_formats(&mut registry),
            Err(ArchiveError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn test_concurrent_registration_behind_mutex() {
        let shared = Mutex::new(FormatRegistry::new());
        std::thread::scope(|s| {
            for (name, priority) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
                let shared = &shared;
                s.spawn(move || {
                    shared.lock().unwrap().register(Named(name, "x"), priority).unwrap();
                });
            }
        });
        let registry = shared.into_inner().unwrap();
        assert_eq!(names(&registry.candidates_for(None).unwrap()), vec!["d", "c", "b", "a"]);
    }
}
