//! Path normalization shared by every backend.
//!
//! Keys are always `/`-separated, relative to the backend root, with no
//! leading separator. Object stores would otherwise materialize an
//! empty-named root prefix for `/a/b`.

/// Key separator used by every backend.
pub const SEPARATOR: char = '/';

/// Normalizes a path into a root-relative key.
///
/// Collapses redundant separators, resolves `.` and `..` tokens and strips
/// leading and trailing separators. A `..` that would climb above the root
/// pops nothing.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for token in path.split(SEPARATOR) {
        match token {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Joins a normalized parent and a child name.
pub fn join(parent: &str, child: &str) -> String {
    normalize(&format!("{}{}{}", parent, SEPARATOR, child))
}

/// Returns the key used as a "directory" prefix: `a/b` becomes `a/b/`,
/// the root stays empty.
pub fn dir_prefix(path: &str) -> String {
    let normalized = normalize(path);
    if normalized.is_empty() {
        normalized
    } else {
        format!("{}{}", normalized, SEPARATOR)
    }
}

/// Returns the last segment of a path.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_parent_token() {
        assert_eq!(normalize("/a/b/../c"), "a/c");
    }

    #[test]
    fn test_normalize_redundant_separators() {
        assert_eq!(normalize("a//b/./c/"), "a/b/c");
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize("./"), "");
    }

    #[test]
    fn test_normalize_leading_parent_pops_nothing() {
        assert_eq!(normalize("../a"), "a");
        assert_eq!(normalize("/../../a/b"), "a/b");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("Molecules", "abc.json"), "Molecules/abc.json");
        assert_eq!(join("", "indexes.json"), "indexes.json");
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(dir_prefix(""), "");
        assert_eq!(dir_prefix("/Molecules/"), "Molecules/");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("Molecules/abc.json"), "abc.json");
        assert_eq!(file_name("Molecules/"), "Molecules");
        assert_eq!(file_name("top"), "top");
    }
}
