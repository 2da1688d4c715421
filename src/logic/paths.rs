//! Pure helpers over slash-delimited branch paths.

/// Path of the root branch.
pub const MAIN: &str = "MAIN";

/// True exactly for the root path.
pub fn is_root(path: &str) -> bool {
    path == MAIN
}

/// The path minus its last segment, or `None` when the path has no parent.
pub fn parent_path(path: &str) -> Option<&str> {
    if is_root(path) {
        return None;
    }
    path.rfind('/').map(|index| &path[..index])
}

/// Strict descendant test: `path` lies somewhere below `ancestor`.
pub fn is_descendant(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len() + 1
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}
