//! Content comparison and file retirement.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::download::filename::{sane_origin_time, unique_backup_path};

/// SHA-256 of a file, streamed.
///
/// # Errors
///
/// Returns the underlying error when the file cannot be read.
pub fn file_digest(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// Whether two files hold the same bytes.
///
/// # Errors
///
/// Returns the underlying error when either file cannot be read.
pub async fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    let (a, b) = (a.to_path_buf(), b.to_path_buf());
    tokio::task::spawn_blocking(move || {
        let a_meta = std::fs::metadata(&a)?;
        let b_meta = std::fs::metadata(&b)?;
        if a_meta.len() != b_meta.len() {
            return Ok(false);
        }
        Ok(file_digest(&a)? == file_digest(&b)?)
    })
    .await
    .map_err(io::Error::other)?
}

/// Moves `path` into `backup_dir` under a free name and returns the new location.
///
/// # Errors
///
/// Returns the underlying error when the directory cannot be created or the
/// move fails.
pub async fn retire_to_backup(path: &Path, backup_dir: &Path) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(backup_dir).await?;
    let destination = unique_backup_path(backup_dir, path);
    move_file(path, &destination).await?;
    debug!(from = %path.display(), to = %destination.display(), "retired file to backup");
    Ok(destination)
}

/// Renames, falling back to copy and delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Applies an origin modification time when it falls in the accepted range.
///
/// Returns whether the time was applied.
pub async fn apply_origin_time(path: &Path, modified: Option<SystemTime>) -> bool {
    let Some(modified) = modified.and_then(sane_origin_time) else {
        return false;
    };
    let path = path.to_path_buf();
    let applied = tokio::task::spawn_blocking(move || {
        let file = File::options().write(true).open(&path)?;
        file.set_times(std::fs::FileTimes::new().set_modified(modified).set_accessed(modified))
    })
    .await;
    match applied {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            debug!(%error, "could not apply origin timestamp");
            false
        }
        Err(error) => {
            debug!(%error, "timestamp task failed");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_content_compares_bytes() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        let c = temp.path().join("c");
        std::fs::write(&a, "identical").unwrap();
        std::fs::write(&b, "identical").unwrap();
        std::fs::write(&c, "different").unwrap();

        assert!(same_content(&a, &b).await.unwrap());
        assert!(!same_content(&a, &c).await.unwrap());
        assert!(same_content(&a, &temp.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_retire_to_backup_moves_file() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("page.html");
        std::fs::write(&original, "old").unwrap();
        let backup = temp.path().join("backup");

        let moved = retire_to_backup(&original, &backup).await.unwrap();

        assert!(!original.exists());
        assert_eq!(moved, backup.join("page.html"));
        assert_eq!(std::fs::read_to_string(moved).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_apply_origin_time_in_range_only() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f.pdf");
        std::fs::write(&file, "x").unwrap();
        let origin = UNIX_EPOCH + Duration::from_secs(1_445_412_480);

        assert!(!apply_origin_time(&file, Some(UNIX_EPOCH)).await);
        assert!(!apply_origin_time(&file, None).await);
        assert!(apply_origin_time(&file, Some(origin)).await);
        assert_eq!(std::fs::metadata(&file).unwrap().modified().unwrap(), origin);
    }
}
