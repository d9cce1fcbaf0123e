//! Registry for the run's temporary files.
//!
//! Every spill and intermediate file is derived from one user-visible
//! prefix and registered here; the registry unlinks everything when it is
//! dropped, which covers both normal exit and unwinding out of a fatal
//! error.

use std::path::{Path, PathBuf};

/// Suffix of the collator spill file.
pub const SUFFIX_COLLATE: &str = "_bamcollate";
/// Suffix of the fragment read-ends file.
pub const SUFFIX_FRAGS: &str = "_readfrags";
/// Suffix of the pair read-ends file.
pub const SUFFIX_PAIRS: &str = "_readpairs";
/// Suffix of the intermediate alignment store.
pub const SUFFIX_ALIGNMENTS: &str = "_alignments";

/// Tracks temp files created under a common prefix and removes them on drop.
pub struct TempFileRegistry {
    prefix: PathBuf,
    registered: Vec<PathBuf>,
}

impl TempFileRegistry {
    /// Creates a registry rooted at `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self { prefix: prefix.into(), registered: Vec::new() }
    }

    /// Derives `<prefix><suffix>`, registering it for removal.
    pub fn path(&mut self, suffix: &str) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_os_string();
        name.push(suffix);
        let path = PathBuf::from(name);
        if !self.registered.contains(&path) {
            self.registered.push(path.clone());
        }
        path
    }

    /// The configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }
}

impl Drop for TempFileRegistry {
    fn drop(&mut self) {
        for path in &self.registered {
            // Files that were never created (mode-dependent) just miss.
            let _ = std::fs::remove_file(path);
        }
    }
}
