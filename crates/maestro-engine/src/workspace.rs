//! File primitives the transaction log relies on for rollback.

use std::fs as stdfs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use maestro_core::{OrchestrationError, Result};
use tokio::fs as tfs;
use uuid::Uuid;

/// Largest file the local implementation will write.
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

/// Atomic single-file operations on the shared workspace.
#[async_trait]
pub trait WorkspaceFs: Send + Sync {
    /// Read a file. A missing file is `Ok(None)`.
    ///
    /// # Errors
    /// Returns an error if the path is unsafe or the read fails.
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Replace a file's content atomically, creating parents as needed.
    ///
    /// # Errors
    /// Returns an error if the path is unsafe, too large, or the write fails.
    async fn write(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Remove a file. Returns whether something was removed.
    ///
    /// # Errors
    /// Returns an error if the path is unsafe or removal fails for a reason
    /// other than the file being absent.
    async fn remove(&self, path: &Path) -> Result<bool>;

    /// Last modification time, or `None` if the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the path is unsafe or metadata lookup fails.
    async fn modified(&self, path: &Path) -> Result<Option<SystemTime>>;
}

/// Workspace file system rooted at a directory on local disk.
///
/// Paths are resolved relative to the root; absolute paths must lie inside it,
/// parent components are rejected, and symlinks are never followed for writes.
pub struct LocalFs {
    root_path: PathBuf,
}

impl LocalFs {
    /// Create a file system rooted at `root_path`.
    pub fn new(root_path: PathBuf) -> Self {
        let canonical = stdfs::canonicalize(&root_path).unwrap_or(root_path);
        Self {
            root_path: Self::normalize_root(&canonical),
        }
    }

    /// Strip the verbatim prefix (\\?\) so relative paths compare cleanly.
    #[cfg(windows)]
    fn normalize_root(path: &Path) -> PathBuf {
        let path_string = path.display().to_string();
        let normalized: String = path_string
            .strip_prefix(r"\\?\")
            .map_or_else(|| path_string.clone(), ToString::to_string);
        PathBuf::from(normalized)
    }

    /// No-op normalization on non-Windows platforms.
    #[cfg(not(windows))]
    fn normalize_root(path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    /// Workspace root.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Resolve `input` to an absolute path inside the root.
    ///
    /// # Errors
    /// Returns an error for absolute paths outside the root or paths containing `..`.
    pub fn resolve(&self, input: &Path) -> Result<PathBuf> {
        let relative = if input.is_absolute() {
            input
                .strip_prefix(&self.root_path)
                .map(Path::to_path_buf)
                .map_err(|_| {
                    OrchestrationError::file_system(
                        input,
                        format!(
                            "absolute path outside workspace root {}",
                            self.root_path.display()
                        ),
                    )
                })?
        } else {
            input.to_path_buf()
        };

        if !Self::is_safe_relative(&relative) {
            return Err(OrchestrationError::file_system(
                input,
                "unsafe relative path",
            ));
        }
        Ok(self.root_path.join(relative))
    }

    fn is_safe_relative(path: &Path) -> bool {
        !path.is_absolute()
            && path
                .components()
                .all(|component| !matches!(component, Component::ParentDir))
    }

    async fn reject_symlink(path: &Path) -> Result<()> {
        match tfs::symlink_metadata(path).await {
            Ok(metadata) if metadata.file_type().is_symlink() => Err(
                OrchestrationError::file_system(path, "refusing to operate through a symlink"),
            ),
            Ok(_) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(OrchestrationError::file_system(path, error)),
        }
    }
}

#[async_trait]
impl WorkspaceFs for LocalFs {
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let abs_path = self.resolve(path)?;
        match tfs::read(&abs_path).await {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(OrchestrationError::file_system(abs_path, error)),
        }
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        if content.len() > MAX_FILE_BYTES {
            return Err(OrchestrationError::file_system(
                path,
                format!("{} bytes exceeds limit of {MAX_FILE_BYTES}", content.len()),
            ));
        }

        let abs_path = self.resolve(path)?;
        Self::reject_symlink(&abs_path).await?;

        let parent = abs_path
            .parent()
            .ok_or_else(|| OrchestrationError::file_system(&abs_path, "path has no parent"))?;
        tfs::create_dir_all(parent)
            .await
            .map_err(|error| OrchestrationError::file_system(parent, error))?;

        let file_name = abs_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        if let Err(error) = tfs::write(&temp_path, content).await {
            drop(tfs::remove_file(&temp_path).await);
            return Err(OrchestrationError::file_system(&abs_path, error));
        }
        if let Err(error) = tfs::rename(&temp_path, &abs_path).await {
            drop(tfs::remove_file(&temp_path).await);
            return Err(OrchestrationError::file_system(&abs_path, error));
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<bool> {
        let abs_path = self.resolve(path)?;
        match tfs::symlink_metadata(&abs_path).await {
            Ok(metadata) => {
                if metadata.is_dir() {
                    return Err(OrchestrationError::file_system(
                        &abs_path,
                        "refusing to remove a directory",
                    ));
                }
                tfs::remove_file(&abs_path)
                    .await
                    .map_err(|error| OrchestrationError::file_system(&abs_path, error))?;
                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(OrchestrationError::file_system(&abs_path, error)),
        }
    }

    async fn modified(&self, path: &Path) -> Result<Option<SystemTime>> {
        let abs_path = self.resolve(path)?;
        match tfs::metadata(&abs_path).await {
            Ok(metadata) => metadata
                .modified()
                .map(Some)
                .map_err(|error| OrchestrationError::file_system(&abs_path, error)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(OrchestrationError::file_system(&abs_path, error)),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code has different conventions"
)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_fs() -> (TempDir, LocalFs) {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let fs = LocalFs::new(tmp_dir.path().to_path_buf());
        (tmp_dir, fs)
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let (_tmp, fs) = create_fs();
        let path = Path::new("nested/dir/file.txt");

        if let Err(error) = fs.write(path, b"hello").await {
            panic!("write failed: {error}");
        }
        assert_eq!(fs.read(path).await.ok().flatten(), Some(b"hello".to_vec()));
        assert!(matches!(fs.modified(path).await, Ok(Some(_))));

        assert!(matches!(fs.remove(path).await, Ok(true)));
        assert!(matches!(fs.read(path).await, Ok(None)));
        assert!(matches!(fs.remove(path).await, Ok(false)));
        assert!(matches!(fs.modified(path).await, Ok(None)));
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let (tmp, fs) = create_fs();
        if let Err(error) = fs.write(Path::new("a.txt"), b"one").await {
            panic!("write failed: {error}");
        }
        if let Err(error) = fs.write(Path::new("a.txt"), b"two").await {
            panic!("overwrite failed: {error}");
        }

        let entries: Vec<String> = match stdfs::read_dir(tmp.path()) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(error) => panic!("read dir failed: {error}"),
        };
        assert_eq!(entries, vec!["a.txt".to_owned()]);
    }

    #[tokio::test]
    async fn test_parent_components_rejected() {
        let (_tmp, fs) = create_fs();
        let result = fs.write(Path::new("../escape.txt"), b"nope").await;
        assert!(matches!(
            result,
            Err(OrchestrationError::FileSystem { .. })
        ));
    }

    #[tokio::test]
    async fn test_absolute_path_inside_root_accepted() {
        let (_tmp, fs) = create_fs();
        let absolute = fs.root_path().join("inside.txt");
        if let Err(error) = fs.write(&absolute, b"ok").await {
            panic!("write failed: {error}");
        }
        assert_eq!(
            fs.read(Path::new("inside.txt")).await.ok().flatten(),
            Some(b"ok".to_vec())
        );
    }

    #[tokio::test]
    async fn test_absolute_path_outside_root_rejected() {
        let (_tmp, fs) = create_fs();
        let other = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let result = fs.read(&other.path().join("x.txt")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (_tmp, fs) = create_fs();
        let content = vec![0u8; MAX_FILE_BYTES + 1];
        let result = fs.write(Path::new("big.bin"), &content).await;
        assert!(result.is_err());
        assert!(matches!(fs.read(Path::new("big.bin")).await, Ok(None)));
    }
}
