//! Virtual path to lower path translation

use std::path::{Path, PathBuf};

/// Maps paths seen through the mount onto the lower directory tree
///
/// Resolution is plain concatenation. `..` components are passed through
/// untouched; whatever the lower filesystem does with them is what the
/// caller gets.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to its lower path
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Convert a lower path back to its virtual path
    pub fn to_virtual(&self, lower_path: &Path) -> Option<PathBuf> {
        lower_path
            .strip_prefix(&self.root)
            .ok()
            .map(|p| PathBuf::from("/").join(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let resolver = PathResolver::new(PathBuf::from("/srv/lower"));

        assert_eq!(resolver.resolve(Path::new("/")), PathBuf::from("/srv/lower"));
        assert_eq!(
            resolver.resolve(Path::new("/a/b.txt")),
            PathBuf::from("/srv/lower/a/b.txt")
        );
        assert_eq!(
            resolver.resolve(Path::new("rel")),
            PathBuf::from("/srv/lower/rel")
        );
    }

    #[test]
    fn test_dotdot_passes_through() {
        let resolver = PathResolver::new(PathBuf::from("/srv/lower"));
        assert_eq!(
            resolver.resolve(Path::new("/../etc")),
            PathBuf::from("/srv/lower/../etc")
        );
    }

    #[test]
    fn test_to_virtual() {
        let resolver = PathResolver::new(PathBuf::from("/srv/lower"));
        assert_eq!(
            resolver.to_virtual(Path::new("/srv/lower/a/b")),
            Some(PathBuf::from("/a/b"))
        );
        assert_eq!(resolver.to_virtual(Path::new("/elsewhere")), None);
    }
}
