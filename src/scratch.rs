//! Scratch space for transient extraction
//!
//! The caller owns the directory and its cleanup policy. Parsers only ask for
//! a place to put a temporary file; files they create are removed when the
//! returned handle is dropped.

use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// "Give me scratch space"
pub trait ScratchSpace {
    /// Directory where temporary files may be created
    fn scratch_dir(&self) -> io::Result<PathBuf>;

    /// Create an empty temporary file inside the scratch directory
    fn temp_file(&self) -> io::Result<NamedTempFile> {
        let dir = self.scratch_dir()?;
        NamedTempFile::new_in(dir)
    }
}

/// Scratch space rooted at a caller-supplied directory
#[derive(Debug, Clone)]
pub struct DirScratch {
    root: PathBuf,
}

impl DirScratch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scratch space in the system temporary directory
    pub fn system_temp() -> Self {
        Self::new(std::env::temp_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ScratchSpace for DirScratch {
    fn scratch_dir(&self) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root)?;
        Ok(self.root.clone())
    }
}

impl ScratchSpace for Path {
    fn scratch_dir(&self) -> io::Result<PathBuf> {
        std::fs::create_dir_all(self)?;
        Ok(self.to_path_buf())
    }
}

impl ScratchSpace for PathBuf {
    fn scratch_dir(&self) -> io::Result<PathBuf> {
        self.as_path().scratch_dir()
    }
}

/// Write `pieces` (offset, length pairs of `source`) into a fresh scratch
/// file and rewind it for reading
pub fn materialize<S: Read + Seek + ?Sized>(
    scratch: &dyn ScratchSpace,
    source: &mut S,
    pieces: &[(u64, u64)],
) -> io::Result<NamedTempFile> {
    let mut file = scratch.temp_file()?;
    for &(offset, len) in pieces {
        crate::stream::copy_range(source, offset, len, file.as_file_mut())?;
    }
    file.as_file_mut().rewind()?;
    Ok(file)
}
