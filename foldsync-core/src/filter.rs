use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

use crate::utils::as_posix_path;

/// Runtime filter for one pair, compiled from its include-extension and
/// exclude-glob lists.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include_ext: Vec<String>,
    exclude: GlobSet,
}

impl PathFilter {
    /// Build a filter. The extension list is normalized first; an empty
    /// include list means "include all". Invalid glob patterns are skipped.
    pub fn new(include_ext: &[String], exclude_globs: &[String]) -> Self {
        Self {
            include_ext: normalize_extensions(include_ext),
            exclude: compile_globs(exclude_globs),
        }
    }

    /// True if the file's extension is on the include list (or the list is
    /// empty).
    pub fn matches_include<P: AsRef<Path>>(&self, path: P) -> bool {
        matches_extension(&self.include_ext, path.as_ref())
    }

    /// True if any exclude glob matches the path, with separators
    /// normalized to forward slashes.
    pub fn matches_exclude<P: AsRef<Path>>(&self, path: P) -> bool {
        !self.exclude.is_empty() && self.exclude.is_match(as_posix_path(path.as_ref()))
    }

    /// Composite decision: included and not excluded.
    pub fn check<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        self.matches_include(path) && !self.matches_exclude(path)
    }
}

/// Extension match against an already-normalized list. Empty list matches
/// everything; comparison is case-insensitive.
pub fn matches_extension(extensions: &[String], path: &Path) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let ext = match path.extension() {
        Some(e) => format!(".{}", e.to_string_lossy().to_lowercase()),
        None => return false,
    };
    extensions.iter().any(|allowed| allowed.to_lowercase() == ext)
}

/// True if any of the glob patterns matches the path. Used for hook filters.
pub fn matches_any_glob(globs: &[String], path: &Path) -> bool {
    if globs.is_empty() {
        return false;
    }
    compile_globs(globs).is_match(as_posix_path(path))
}

/// Decide whether a hook fires for a synchronized file. Hooks with neither
/// an extension list nor a glob list fire for every file; otherwise either
/// list matching is enough.
pub fn hook_matches(extensions: &[String], globs: &[String], rel_path: &str) -> bool {
    if extensions.is_empty() && globs.is_empty() {
        return true;
    }
    let path = Path::new(rel_path);
    if !extensions.is_empty() && matches_extension(extensions, path) {
        return true;
    }
    !globs.is_empty() && matches_any_glob(globs, path)
}

/// Normalize an include-extension list: trim, lowercase, ensure a leading
/// dot, drop duplicates. A `*` or `.*` entry collapses the whole list to
/// empty, which means match-all.
pub fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(extensions.len());
    for ext in extensions {
        let clean = ext.trim().to_lowercase();
        if clean.is_empty() {
            continue;
        }
        if clean == "*" || clean == ".*" {
            return Vec::new();
        }
        let clean = if clean.starts_with('.') { clean } else { format!(".{clean}") };
        if !normalized.contains(&clean) {
            normalized.push(clean);
        }
    }
    normalized
}

fn compile_globs(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    // compile patterns, ignore compile errors individually
    for pat in patterns {
        if let Ok(g) = Glob::new(pat) {
            builder.add(g);
        }
    }
    builder
        .build()
        .unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap())
}
