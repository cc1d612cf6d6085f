//! Read-only retrieval of key material by logical path.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CaError, Result};

/// Fetches key bytes (CA key, SSH host key) by path.
///
/// Local disk, object storage and secret stores are interchangeable behind
/// this trait.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Reads keys from the local filesystem, relative paths resolved against `root`.
#[derive(Debug, Clone, Default)]
pub struct FileKeySource {
    root: Option<PathBuf>,
}

impl FileKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `root` (usually the config file's directory).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        match &self.root {
            Some(root) if p.is_relative() => root.join(p),
            _ => p.to_path_buf(),
        }
    }
}

#[async_trait]
impl KeySource for FileKeySource {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve(path);
        debug!(path = %resolved.display(), "reading key material");
        tokio::fs::read(&resolved)
            .await
            .map_err(|e| CaError::KeySource(format!("{}: {e}", resolved.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_relative_to_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut file = std::fs::File::create(dir.path().join("ca")).unwrap();
        file.write_all(b"key bytes").unwrap();

        let source = FileKeySource::with_root(dir.path());
        assert_eq!(source.read("ca").await.unwrap(), b"key bytes");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let source = FileKeySource::new();
        assert!(matches!(
            source.read("/nonexistent/sshca/key").await,
            Err(CaError::KeySource(_))
        ));
    }
}
