use crate::error::{Result, StashError};
use std::path::{Component, Path, PathBuf};

/// Normalizes client-supplied paths into canonical relative paths under the
/// cache root.
///
/// Clients hand the proxy arbitrary strings; anything that would resolve
/// outside the cache root (directory traversal) is rejected before any cache
/// or remote interaction happens.
pub struct PathResolver {
    cache_root: PathBuf,
}

impl PathResolver {
    pub fn new(cache_root: PathBuf) -> Self {
        PathResolver { cache_root }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolve a raw client path to its canonical relative form.
    ///
    /// Segment rules: empty and `.` segments are dropped; `..` pops the
    /// previous segment and is silently ignored at the top, so a path can
    /// never climb above the root. An empty result (the raw path named the
    /// root itself) is not an openable file and fails `NotFound`.
    pub fn resolve(&self, raw: &str) -> Result<String> {
        self.check_containment(raw)?;

        let mut stack: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    stack.pop();
                }
                other => stack.push(other),
            }
        }

        if stack.is_empty() {
            tracing::debug!("resolve: {:?} normalizes to the cache root", raw);
            return Err(StashError::NotFound(PathBuf::from(raw)));
        }

        let canonical = stack.join("/");
        tracing::trace!("resolve: {:?} -> {:?}", raw, canonical);
        Ok(canonical)
    }

    /// The shared cache location for a canonical path.
    pub fn cache_path(&self, canonical: &str) -> PathBuf {
        self.cache_root.join(canonical)
    }

    /// Reject any candidate whose lexically normalized absolute form is not
    /// a descendant of the cache root. The candidate may not exist yet, so
    /// normalization is lexical rather than `canonicalize`.
    fn check_containment(&self, raw: &str) -> Result<()> {
        // A leading separator is relative to the cache root, not the real
        // filesystem root; `join` would otherwise replace the root outright.
        let candidate = self.cache_root.join(raw.trim_start_matches('/'));
        let normalized = lexical_normalize(&candidate);

        if !normalized.starts_with(&self.cache_root) {
            tracing::warn!(
                "resolve: {:?} escapes the cache root {}",
                raw,
                self.cache_root.display()
            );
            return Err(StashError::NotFound(PathBuf::from(raw)));
        }
        Ok(())
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
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

    fn resolver() -> PathResolver {
        PathResolver::new(PathBuf::from("/cache/root"))
    }

    #[test]
    fn plain_paths_pass_through() {
        assert_eq!(resolver().resolve("foo.txt").unwrap(), "foo.txt");
        assert_eq!(resolver().resolve("dir/foo.txt").unwrap(), "dir/foo.txt");
    }

    #[test]
    fn dot_and_empty_segments_are_dropped() {
        assert_eq!(resolver().resolve("./dir//./foo.txt").unwrap(), "dir/foo.txt");
    }

    #[test]
    fn parent_segments_pop_within_the_root() {
        assert_eq!(resolver().resolve("dir/sub/../foo.txt").unwrap(), "dir/foo.txt");
        assert_eq!(resolver().resolve("a/b/../../c").unwrap(), "c");
    }

    #[test]
    fn leading_separator_is_relative_to_the_root() {
        assert_eq!(resolver().resolve("/etc/passwd").unwrap(), "etc/passwd");
    }

    #[test]
    fn escape_attempts_are_rejected() {
        assert!(matches!(
            resolver().resolve("../../etc/passwd"),
            Err(StashError::NotFound(_))
        ));
        assert!(matches!(
            resolver().resolve("dir/../../../etc/passwd"),
            Err(StashError::NotFound(_))
        ));
    }

    #[test]
    fn root_itself_is_not_a_file() {
        assert!(matches!(resolver().resolve(""), Err(StashError::NotFound(_))));
        assert!(matches!(resolver().resolve("."), Err(StashError::NotFound(_))));
        assert!(matches!(resolver().resolve("a/.."), Err(StashError::NotFound(_))));
    }

    #[test]
    fn cache_path_joins_canonical_under_root() {
        let r = resolver();
        let canonical = r.resolve("dir/foo.txt").unwrap();
        assert_eq!(r.cache_path(&canonical), PathBuf::from("/cache/root/dir/foo.txt"));
    }
}
