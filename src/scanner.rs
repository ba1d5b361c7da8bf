use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

use crate::error::{EmberError, Result};

/// Extension → language tag table. The tag lands in the chunk's `lang`
/// column and drives structural-chunker selection; extensions missing from
/// this table but present in [`WINDOWED_EXTS`] are indexed with the
/// line-window strategy and an empty tag.
const LANG_BY_EXT: &[(&str, &str)] = &[
    ("rs", "rs"),
    ("py", "py"),
    ("pyi", "py"),
    ("ts", "ts"),
    ("tsx", "ts"),
    ("mts", "ts"),
    ("cts", "ts"),
    ("js", "js"),
    ("jsx", "js"),
    ("mjs", "js"),
    ("cjs", "js"),
    ("go", "go"),
    ("java", "java"),
];

/// Extensions indexed without a structural grammar: plain line windows.
const WINDOWED_EXTS: &[&str] = &[
    "c", "h", "cc", "cpp", "hpp", "cs", "rb", "php", "swift", "kt", "kts", "scala", "sh", "bash",
    "zsh", "sql", "proto", "md", "rst", "txt", "toml", "yaml", "yml", "json", "html", "css",
    "scss", "vue", "svelte",
];

/// Directory names skipped anywhere in the tree, regardless of ignore files.
/// Mirrors the usual high-noise build artifacts.
const JUNK_DIR_NAMES: &[&str] = &[
    ".git",
    ".ember",
    "node_modules",
    "target",
    "dist",
    "build",
    "coverage",
    ".next",
    ".nuxt",
    "out",
    "__pycache__",
    ".venv",
];

/// Ember-specific ignore file, same format as `.gitignore`.
pub const EMBER_IGNORE_FILE: &str = ".emberignore";

/// Compile a user-supplied path filter with the documented semantics:
/// `**` crosses directories, `*` stays inside one path segment, `?` is a
/// single character. Malformed patterns are user errors.
pub fn compile_path_glob(pattern: &str) -> Result<globset::GlobMatcher> {
    globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| EmberError::InvalidPathFilter {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// Compile `<root>/.emberignore` when present. Shared by the VCS probe's
/// `is_ignored` and the indexer's file filter.
pub fn build_ember_ignore(repo_root: &Path) -> Option<Gitignore> {
    let ignore_path = repo_root.join(EMBER_IGNORE_FILE);
    if !ignore_path.is_file() {
        return None;
    }
    let mut builder = GitignoreBuilder::new(repo_root);
    builder.add(&ignore_path);
    match builder.build() {
        Ok(gi) => Some(gi),
        Err(e) => {
            tracing::warn!("malformed {}: {e}", EMBER_IGNORE_FILE);
            None
        }
    }
}

pub fn lang_for_path(path: &str) -> &'static str {
    let ext = ext_lower(path);
    LANG_BY_EXT
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
        .unwrap_or("")
}

/// Whether the extension is on the indexable whitelist at all.
pub fn is_indexable_ext(path: &str) -> bool {
    let ext = ext_lower(path);
    LANG_BY_EXT.iter().any(|(e, _)| *e == ext) || WINDOWED_EXTS.contains(&ext.as_str())
}

fn ext_lower(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

fn has_junk_component(path: &str, extra_dir_names: &[String]) -> bool {
    path.split('/').any(|comp| {
        JUNK_DIR_NAMES.contains(&comp) || extra_dir_names.iter().any(|d| d.trim_matches('/') == comp)
    })
}

/// Decides which repository-relative paths enter the index. Combines the
/// extension whitelist, the junk-directory list, the configured extra
/// excludes, and `.emberignore`. Repository `.gitignore` rules are already
/// honoured upstream by the VCS probe (ignored files never appear in a
/// tree listing), so they are not re-checked here.
pub struct FileFilter {
    extra_dir_names: Vec<String>,
    ember_ignore: Option<Gitignore>,
}

impl FileFilter {
    pub fn new(repo_root: &Path, extra_dir_names: &[String]) -> Self {
        Self {
            extra_dir_names: extra_dir_names.to_vec(),
            ember_ignore: build_ember_ignore(repo_root),
        }
    }

    pub fn is_ember_ignored(&self, rel_path: &str) -> bool {
        self.ember_ignore
            .as_ref()
            // Parent-aware: a `vendor/` rule must cover `vendor/lib.rs`.
            .map(|gi| gi.matched_path_or_any_parents(rel_path, false).is_ignore())
            .unwrap_or(false)
    }

    pub fn admits(&self, rel_path: &str) -> bool {
        if !is_indexable_ext(rel_path) {
            return false;
        }
        if has_junk_component(rel_path, &self.extra_dir_names) {
            return false;
        }
        !self.is_ember_ignored(rel_path)
    }
}
