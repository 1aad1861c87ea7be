//! Template stores: where template bytes come from
//!
//! The generator only ever asks a store for the bytes of a named template.
//! This module provides the trait and the usual implementations:
//! - `DirTemplateStore`: a directory on disk, sandboxed to its root
//! - `MemoryTemplateStore`: templates held in memory (embedded bundles, tests)
//! - any closure `Fn(&str) -> Result<Vec<u8>>`
//!
//! Stores must be safe for concurrent reads; they are shared between
//! independent generation runs.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{CoreError, Result};

/// Resolves a template name to its raw bytes
pub trait TemplateStore: Send + Sync {
    /// Read a template. A missing template is `CoreError::TemplateNotFound`.
    fn resolve(&self, name: &str) -> Result<Vec<u8>>;

    /// Read a template as UTF-8 text
    fn resolve_string(&self, name: &str) -> Result<String> {
        let bytes = self.resolve(name)?;
        String::from_utf8(bytes).map_err(|e| CoreError::TemplateAccess {
            name: name.to_string(),
            message: format!("template is not valid UTF-8: {}", e),
        })
    }
}

impl<F> TemplateStore for F
where
    F: Fn(&str) -> Result<Vec<u8>> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Result<Vec<u8>> {
        self(name)
    }
}

/// Template store backed by a directory
///
/// Template names are paths relative to the root. Absolute names and names
/// escaping the root are rejected. Each template is read from disk once.
#[derive(Debug)]
pub struct DirTemplateStore {
    root: PathBuf,
    canonical_root: PathBuf,
    cache: RwLock<HashMap<String, Vec<u8>>>,
}

impl DirTemplateStore {
    /// Create a store rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns an error if the root is missing or is not a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let canonical_root = match root.canonicalize() {
            Ok(path) if path.is_dir() => path,
            Ok(_) => {
                return Err(access_error(
                    root.display(),
                    "template root is not a directory".to_string(),
                ));
            }
            Err(e) => {
                return Err(access_error(
                    root.display(),
                    format!("cannot open template root: {}", e),
                ));
            }
        };

        Ok(Self {
            root,
            canonical_root,
            cache: RwLock::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the file behind a template name, inside the root
    fn locate(&self, name: &str) -> Result<PathBuf> {
        if Path::new(name).is_absolute() {
            return Err(access_error(
                name,
                "absolute template names are not allowed".to_string(),
            ));
        }

        let path = match self.root.join(name).canonicalize() {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::TemplateNotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(access_error(name, format!("failed to resolve path: {}", e))),
        };

        if !path.starts_with(&self.canonical_root) {
            return Err(access_error(name, "path escapes the template root".to_string()));
        }
        if !path.is_file() {
            return Err(CoreError::TemplateNotFound {
                name: name.to_string(),
            });
        }
        Ok(path)
    }

    fn cached(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let cache = self
            .cache
            .read()
            .map_err(|_| access_error(name, "template cache poisoned".to_string()))?;
        Ok(cache.get(name).cloned())
    }
}

impl TemplateStore for DirTemplateStore {
    fn resolve(&self, name: &str) -> Result<Vec<u8>> {
        if let Some(content) = self.cached(name)? {
            return Ok(content);
        }

        let path = self.locate(name)?;
        let content = std::fs::read(&path)
            .map_err(|e| access_error(name, format!("failed to read file: {}", e)))?;
        tracing::trace!(template = name, bytes = content.len(), "read template");

        self.cache
            .write()
            .map_err(|_| access_error(name, "template cache poisoned".to_string()))?
            .insert(name.to_string(), content.clone());
        Ok(content)
    }
}

fn access_error(name: impl std::fmt::Display, message: String) -> CoreError {
    CoreError::TemplateAccess {
        name: name.to_string(),
        message,
    }
}

/// In-memory template store
#[derive(Debug, Default, Clone)]
pub struct MemoryTemplateStore {
    templates: BTreeMap<String, Vec<u8>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template
    pub fn with_template(mut self, name: &str, content: impl Into<Vec<u8>>) -> Self {
        self.insert(name, content);
        self
    }

    /// Add multiple templates at once
    pub fn with_templates<'a>(
        mut self,
        templates: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        for (name, content) in templates {
            self.insert(name, content);
        }
        self
    }

    pub fn insert(&mut self, name: &str, content: impl Into<Vec<u8>>) {
        self.templates.insert(name.to_string(), content.into());
    }

    /// Snapshot every file below `root` into memory
    ///
    /// Template names are the slash-separated paths relative to `root`.
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut store = Self::new();

        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| CoreError::TemplateAccess {
                name: root.display().to_string(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            store.insert(&name, std::fs::read(entry.path())?);
        }

        Ok(store)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Template names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn resolve(&self, name: &str) -> Result<Vec<u8>> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::TemplateNotFound {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_asset_tree() -> TempDir {
        let temp = TempDir::new().unwrap();

        std::fs::create_dir_all(temp.path().join("base/rbac")).unwrap();
        std::fs::write(temp.path().join("base/controller.yaml"), "kind: Deployment").unwrap();
        std::fs::write(temp.path().join("base/rbac/role.yaml"), "kind: Role").unwrap();

        temp
    }

    #[test]
    fn test_dir_store_resolves_relative_names() {
        let temp = create_asset_tree();
        let store = DirTemplateStore::new(temp.path()).unwrap();

        assert_eq!(
            store.resolve_string("base/controller.yaml").unwrap(),
            "kind: Deployment"
        );
        assert_eq!(store.resolve("base/rbac/role.yaml").unwrap(), b"kind: Role");
    }

    #[test]
    fn test_dir_store_missing_template() {
        let temp = create_asset_tree();
        let store = DirTemplateStore::new(temp.path()).unwrap();

        let err = store.resolve("base/missing.yaml").unwrap_err();
        assert!(matches!(
            err,
            CoreError::TemplateNotFound { ref name } if name == "base/missing.yaml"
        ));
    }

    #[test]
    fn test_dir_store_rejects_absolute_names() {
        let temp = create_asset_tree();
        let store = DirTemplateStore::new(temp.path()).unwrap();

        let err = store.resolve("/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_dir_store_rejects_traversal() {
        let temp = create_asset_tree();
        let parent = temp.path().parent().unwrap();
        let outside = parent.join(format!(
            "{}-outside.yaml",
            temp.path().file_name().unwrap().to_string_lossy()
        ));
        std::fs::write(&outside, "secret: true").unwrap();

        let store = DirTemplateStore::new(temp.path()).unwrap();
        let name = format!("../{}", outside.file_name().unwrap().to_string_lossy());
        let result = store.resolve(&name);
        std::fs::remove_file(&outside).unwrap();

        assert!(result.unwrap_err().to_string().contains("escapes"));
    }

    #[test]
    fn test_dir_store_requires_root() {
        let temp = TempDir::new().unwrap();
        assert!(DirTemplateStore::new(temp.path().join("nope")).is_err());
    }

    #[test]
    fn test_dir_store_caches_reads() {
        let temp = create_asset_tree();
        let store = DirTemplateStore::new(temp.path()).unwrap();

        let first = store.resolve("base/controller.yaml").unwrap();
        std::fs::write(temp.path().join("base/controller.yaml"), "kind: Changed").unwrap();
        let second = store.resolve("base/controller.yaml").unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_dir_store_shared_between_threads() {
        let temp = create_asset_tree();
        let store = DirTemplateStore::new(temp.path()).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    assert_eq!(store.resolve("base/rbac/role.yaml").unwrap(), b"kind: Role");
                });
            }
        });
        assert_eq!(store.cache.read().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTemplateStore::new()
            .with_template("a.yaml", "a: 1")
            .with_templates([("b.yaml", "b: 2")]);

        assert!(store.contains("a.yaml"));
        assert_eq!(store.resolve_string("b.yaml").unwrap(), "b: 2");
        assert!(matches!(
            store.resolve("c.yaml"),
            Err(CoreError::TemplateNotFound { .. })
        ));
    }

    #[test]
    fn test_memory_store_from_dir() {
        let temp = create_asset_tree();
        let store = MemoryTemplateStore::from_dir(temp.path()).unwrap();

        let names: Vec<_> = store.names().collect();
        assert_eq!(names, vec!["base/controller.yaml", "base/rbac/role.yaml"]);
    }

    #[test]
    fn test_closure_store() {
        let store = |name: &str| -> Result<Vec<u8>> {
            if name == "only.yaml" {
                Ok(b"only: true".to_vec())
            } else {
                Err(CoreError::TemplateNotFound {
                    name: name.to_string(),
                })
            }
        };

        assert_eq!(store.resolve("only.yaml").unwrap(), b"only: true");
        assert!(store.resolve("other.yaml").is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let store = MemoryTemplateStore::new().with_template("bin", vec![0xff, 0xfe]);
        let err = store.resolve_string("bin").unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }
}
