use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

use super::{validate_key, ObjectStore};

/// Object store backed by a directory tree: key `a/b/c` is file `<root>/a/b/c`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn walk(&self, dir: PathBuf, keys: &mut Vec<String>) -> Result<()> {
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("listing {}", dir.display()))
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    if path.extension().is_some_and(|ext| ext == "partial") {
                        continue;
                    }
                    let rel = path
                        .strip_prefix(&self.root)
                        .with_context(|| format!("{} escaped the store root", path.display()))?;
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        // Write-then-rename so readers never observe a torn object.
        let tmp = path.with_extension(format!("{}.partial", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, &data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Start from the deepest directory the prefix fully names.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_part)?
        };
        let mut keys = Vec::new();
        self.walk(start, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let data = self
            .get(from)
            .await?
            .with_context(|| format!("copy source {} does not exist", from))?;
        self.put(to, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("projects/p1/a.txt", b"x".to_vec()).await.unwrap();
        assert_eq!(
            store.get("projects/p1/a.txt").await.unwrap().as_deref(),
            Some(&b"x"[..])
        );
        assert!(dir.path().join("projects/p1/a.txt").is_file());

        store.delete("projects/p1/a.txt").await.unwrap();
        assert!(store.get("projects/p1/a.txt").await.unwrap().is_none());
        // Idempotent
        store.delete("projects/p1/a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_prefix_is_sorted_and_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("projects/p1/b/c.txt", b"y".to_vec()).await.unwrap();
        store.put("projects/p1/a.txt", b"x".to_vec()).await.unwrap();
        store.put("projects/p10/z.txt", b"z".to_vec()).await.unwrap();

        let keys = store.list("projects/p1/").await.unwrap();
        assert_eq!(keys, vec!["projects/p1/a.txt", "projects/p1/b/c.txt"]);

        assert!(store.list("projects/missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("a/one", b"1".to_vec()).await.unwrap();
        store.copy("a/one", "b/two").await.unwrap();
        assert_eq!(store.get("b/two").await.unwrap().unwrap(), b"1");
        assert!(store.copy("a/missing", "b/three").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("bucket"));
        assert!(store.put("../escape", b"x".to_vec()).await.is_err());
        assert!(!dir.path().join("escape").exists());
    }
}
