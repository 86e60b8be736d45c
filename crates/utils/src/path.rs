use std::path::{Component, Path, PathBuf};

/// Render `path` relative to `base` when it lives underneath it, otherwise unchanged.
pub fn make_path_relative(path: &str, base: &str) -> String {
    let path_buf = Path::new(path);
    if base.is_empty() || !path_buf.is_absolute() {
        return path.to_string();
    }

    match path_buf.strip_prefix(base) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

/// Lexically normalize a path (`.` and `..` removed, no filesystem access).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether two workspace paths name the same directory, ignoring trailing slashes.
pub fn same_workspace(a: &Path, b: &Path) -> bool {
    normalize_path(a) == normalize_path(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_inside_base() {
        assert_eq!(make_path_relative("/repo/src/main.rs", "/repo"), "src/main.rs");
        assert_eq!(make_path_relative("/repo", "/repo"), ".");
        assert_eq!(make_path_relative("/other/x", "/repo"), "/other/x");
        assert_eq!(make_path_relative("src/x", "/repo"), "src/x");
    }

    #[test]
    fn workspace_comparison_is_lexical() {
        assert!(same_workspace(Path::new("/repo/"), Path::new("/repo")));
        assert!(same_workspace(Path::new("/repo/./a/../"), Path::new("/repo")));
        assert!(!same_workspace(Path::new("/repo-2"), Path::new("/repo")));
    }
}
