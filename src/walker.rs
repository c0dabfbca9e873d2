use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::error::{Error, Result};

/// A discovered markdown file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Path relative to the corpus root.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

impl DiscoveredFile {
    /// Stable source identifier: the relative path with `/` separators.
    pub fn source_path(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// File extensions treated as documents.
const SUPPORTED_EXTENSIONS: &[&str] = &["md"];

/// Recursively discover markdown files under `root`.
///
/// Hidden entries and anything excluded by `.gitignore`/`.ignore` files are
/// skipped. Results are sorted by relative path so indexing order is stable.
pub fn discover_files(root: &Path) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    if !canonical_root.is_dir() {
        return Err(Error::NotFound {
            kind: "directory",
            name: root.display().to_string(),
        });
    }

    let mut results = Vec::new();
    let walker = WalkBuilder::new(&canonical_root)
        .hidden(true)
        .follow_links(true)
        .require_git(false)
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file())
            || !is_supported(entry.path())
        {
            continue;
        }
        let relative_path = entry
            .path()
            .strip_prefix(&canonical_root)
            .unwrap_or(entry.path())
            .to_path_buf();
        results.push(DiscoveredFile {
            relative_path,
            absolute_path: entry.path().to_path_buf(),
        });
    }

    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}
