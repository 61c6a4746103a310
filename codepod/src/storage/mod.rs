pub mod fs;
pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

/// Durable remote object storage for project files.
///
/// Keys are `/`-separated paths such as `projects/p1/src/main.js`. Listing is
/// by prefix and returns keys in lexicographic order.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Object contents, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn copy(&self, from: &str, to: &str) -> Result<()>;
}

/// Reject keys that could escape a directory-backed store.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("object key is empty");
    }
    if key.starts_with('/') {
        bail!("object key {:?} must not be absolute", key);
    }
    for part in key.split('/') {
        match part {
            "" => bail!("object key {:?} has an empty component", key),
            "." | ".." => bail!("object key {:?} has a relative component", key),
            _ => {}
        }
    }
    if key.contains('\0') {
        bail!("object key {:?} contains a NUL byte", key);
    }
    Ok(())
}
