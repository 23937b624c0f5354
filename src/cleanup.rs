//! Best-effort removal of temporary job files.

use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

/// Removes `path` if it exists. Failures are logged, never returned.
pub async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temporary file"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(message = "Could not remove temporary file", path = %path.display(), error = ?err),
    }
}

/// Size of a regular file, or `None` if it is missing.
pub async fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .await
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        fs::write(&path, b"data").await.unwrap();
        assert_eq!(file_size(&path).await, Some(4));

        remove_quietly(&path).await;
        assert_eq!(file_size(&path).await, None);

        // Already gone: still fine.
        remove_quietly(&path).await;
        assert_eq!(file_size(dir.path()).await, None);
    }
}
