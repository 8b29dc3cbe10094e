/// File system operations abstraction for testing
///
/// This module provides a trait-based abstraction over file system operations
/// that can be easily mocked in tests using the `mockall` crate.
///
/// # Examples
///
/// ```rust,no_run
/// use ralphd::fs::{FileSystemOperations, StandardFileSystem};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let fs_ops: Arc<dyn FileSystemOperations> = Arc::new(StandardFileSystem);
///
///     fs_ops.create_dir_all(".ralph").await?;
///     fs_ops.write("test.txt", b"Hello, world!").await?;
///
///     if fs_ops.exists("test.txt") {
///         println!("File was created successfully");
///     }
///
///     Ok(())
/// }
/// ```
use anyhow::Result;
use std::path::Path;

#[cfg(test)]
use mockall::automock;

/// Trait for file system operations that can be mocked in tests
///
/// This trait abstracts common file system operations to enable easy testing
/// through mocking. All methods are designed to be mockable using the `mockall` crate.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait FileSystemOperations: Send + Sync {
    /// Create a directory and all its parent directories
    async fn create_dir_all(&self, path: &str) -> Result<()>;

    /// Write data to a file, creating the file if it doesn't exist
    async fn write(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Write data via a temp-file-then-rename, so concurrent readers always
    /// observe either the pre- or post-write content, never a partial file.
    async fn write_atomic(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Check if a path exists
    fn exists(&self, path: &str) -> bool;

    /// Read a file's contents as bytes, if it exists.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Execute a command and return its output
    async fn execute_command(&self, program: &str, args: &[String]) -> Result<std::process::Output>;
}

/// Standard implementation that uses actual file system operations
pub struct StandardFileSystem;

#[async_trait::async_trait]
impl FileSystemOperations for StandardFileSystem {
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await.map_err(Into::into)
    }

    async fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        tokio::fs::write(path, contents).await.map_err(Into::into)
    }

    async fn write_atomic(&self, path: &str, contents: &[u8]) -> Result<()> {
        let target = Path::new(path);
        let temp_path = target.with_extension(format!(
            "{}.tmp-{}",
            target.extension().and_then(|e| e.to_str()).unwrap_or("json"),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&temp_path, contents).await?;
        tokio::fs::rename(&temp_path, target).await?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(Into::into)
    }

    async fn execute_command(&self, program: &str, args: &[String]) -> Result<std::process::Output> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("tasks.json");
        let fs = StandardFileSystem;
        fs.write_atomic(target.to_str().unwrap(), b"{}").await.unwrap();
        assert_eq!(fs.read(target.to_str().unwrap()).await.unwrap(), b"{}");
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn write_atomic_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("tasks.json");
        let fs = StandardFileSystem;
        fs.write_atomic(target.to_str().unwrap(), b"{\"a\":1}").await.unwrap();
        fs.write_atomic(target.to_str().unwrap(), b"{\"a\":2}").await.unwrap();
        assert_eq!(fs.read(target.to_str().unwrap()).await.unwrap(), b"{\"a\":2}");
    }
}
