//! URL path to filesystem path resolution.
//!
//! The resolver is the security boundary of the gateway: every path a
//! request names must come out of [`resolve`] before it touches the
//! filesystem, and whatever comes out is guaranteed to live under the
//! served root.

use std::path::{Component, Path, PathBuf};

use crate::error::Error;

/// Normalize a URL path fragment syntactically: runs of `/` collapse to
/// one, leading and trailing separators are trimmed, and `.` / `..`
/// segments are interpreted without consulting the filesystem. Leading
/// `..` segments that cannot be resolved are retained, so callers can
/// recognize paths that try to climb above the root.
///
/// The result always starts with `/`.
pub fn clean(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        match segment {
            "." => {}
            ".." => match stack.last() {
                Some(&last) if last != ".." => {
                    stack.pop();
                }
                _ => stack.push(".."),
            },
            other => stack.push(other),
        }
    }
    format!("/{}", stack.join("/"))
}

/// True if the normalized path still points above its root.
pub fn is_trash(path: &str) -> bool {
    path == "/.." || path.starts_with("/../")
}

/// Resolve a URL path fragment to an absolute path under `root`.
///
/// Resolution is syntactic by default: `.` and `..` are interpreted
/// lexically and symlinks are left alone, so paths that do not exist yet
/// (auto-created repositories) resolve fine. With `follow_symlinks`,
/// existing paths are additionally canonicalized before the containment
/// check, which stops symlinks inside the root from pointing out of it.
///
/// Fails with [`Error::Forbidden`] when the result is not a descendant of
/// `root`. The prefix check is component-wise, so `/srv/git-evil` is not
/// mistaken for a child of `/srv/git`.
pub fn resolve(root: &Path, fragment: &str, follow_symlinks: bool) -> Result<PathBuf, Error> {
    let cleaned = clean(fragment);
    let joined = root.join(cleaned.trim_start_matches('/'));
    let mut path = normalize(&joined);

    if follow_symlinks && path.exists() {
        path = path.canonicalize()?;
    }
    if !is_within(&path, root) {
        return Err(Error::Forbidden);
    }
    Ok(path)
}

/// True if `path` is `root` or one of its descendants, compared
/// component-wise.
pub fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Lexically normalize an absolute path: `.` disappears, `..` pops one
/// component, and `..` at the root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clean_collapses_garbage() {
        // The worst path the router is expected to survive.
        assert_eq!(
            clean("//qwre/asdf/..*/*/*///.././../qwer/./..//../../.././//yuioghkj/../wrt.sdaf"),
            "/wrt.sdaf"
        );
        assert_eq!(clean("//a//b///c/"), "/a/b/c");
        assert_eq!(clean("a/./b/../c"), "/a/c");
        assert_eq!(clean(""), "/");
        assert_eq!(clean("/"), "/");
    }

    #[test]
    fn test_clean_keeps_unresolvable_parents() {
        assert_eq!(clean("../a"), "/../a");
        assert_eq!(clean("a/../../b"), "/../b");
        assert_eq!(clean("../../wrt.sdaf"), "/../../wrt.sdaf");
    }

    #[test]
    fn test_trash_detection() {
        assert!(is_trash("/.."));
        assert!(is_trash("/../etc/passwd"));
        assert!(!is_trash("/a/..b"));
        assert!(!is_trash("/repo.git"));
    }

    #[test]
    fn test_resolve_stays_under_root() {
        let root = Path::new("/srv/git");

        assert_eq!(
            resolve(root, "repo.git", false).unwrap(),
            Path::new("/srv/git/repo.git")
        );
        assert_eq!(
            resolve(root, "/a//b/./c", false).unwrap(),
            Path::new("/srv/git/a/b/c")
        );
        assert_eq!(
            resolve(root, "a/../b", false).unwrap(),
            Path::new("/srv/git/b")
        );
        assert_eq!(resolve(root, "", false).unwrap(), Path::new("/srv/git"));
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/srv/git");

        assert!(matches!(
            resolve(root, "../etc/passwd", false),
            Err(Error::Forbidden)
        ));
        assert!(matches!(
            resolve(root, "a/../../../etc", false),
            Err(Error::Forbidden)
        ));
        // A sibling sharing the root's name as a prefix is not a child.
        assert!(matches!(
            resolve(root, "../git-evil/repo", false),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn test_is_within_is_component_wise() {
        assert!(is_within(Path::new("/srv/git/x"), Path::new("/srv/git")));
        assert!(is_within(Path::new("/srv/git"), Path::new("/srv/git")));
        assert!(!is_within(Path::new("/srv/git-evil"), Path::new("/srv/git")));
        assert!(!is_within(Path::new("/srv"), Path::new("/srv/git")));
    }
}
