//! Backup roots.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// A configured sync root. Identity is the `(name, root)` pair; the name
/// doubles as the remote container name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Backup {
    pub name: String,
    pub root: PathBuf,
}

impl Backup {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Remote container holding this backup's objects
    pub fn container(&self) -> &str {
        &self.name
    }

    /// Remote object key for a file: its path relative to the root, joined with `/`.
    ///
    /// Returns `None` for the root itself, for paths outside the root and for
    /// paths carrying `..` components.
    pub fn object_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_is_relative_and_slash_separated() {
        let backup = Backup::new("photos", "/data/photos");
        assert_eq!(
            backup.object_key(Path::new("/data/photos/2024/a.jpg")).as_deref(),
            Some("2024/a.jpg")
        );
        assert_eq!(backup.object_key(Path::new("/data/photos")), None);
        assert_eq!(backup.object_key(Path::new("/data/other/a.jpg")), None);
        assert_eq!(backup.object_key(Path::new("/data/photos/../x")), None);
    }

    #[test]
    fn test_sibling_with_shared_prefix_has_no_key() {
        let backup = Backup::new("photos", "/data/photos");
        assert_eq!(backup.object_key(Path::new("/data/photosx/a.jpg")), None);
    }
}
