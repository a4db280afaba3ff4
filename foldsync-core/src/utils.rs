use std::path::Path;

/// Render a path with forward slashes, the form used for glob matching,
/// hook templates and log output.
pub fn as_posix_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Relative path from `base` to `target`, normalized with forward slashes.
/// Falls back to `target` itself when it is not under `base`.
pub fn rel_path(base: &Path, target: &Path) -> String {
    let rel = target.strip_prefix(base).unwrap_or(target);
    as_posix_path(rel)
}

/// Prefix absolute Windows paths with `\\?\` (`\\?\UNC\` for UNC roots) so
/// paths longer than 260 characters keep working. Relative paths and paths
/// already in long form are returned unchanged.
pub fn normalize_long_path(path: &str) -> String {
    if path.is_empty() || path.starts_with(r"\\?\") {
        return path.to_string();
    }
    if let Some(rest) = path.strip_prefix(r"\\") {
        return format!(r"\\?\UNC\{rest}");
    }
    let bytes = path.as_bytes();
    let has_drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/');
    if has_drive {
        return format!(r"\\?\{path}");
    }
    path.to_string()
}
