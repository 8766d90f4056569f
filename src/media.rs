//! On-disk storage for photos received over chat.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use crate::store::TenantId;

/// Save an uploaded photo as `<dir>/<tenant>/<timestamp>_<uuid>.jpg`.
pub async fn save_upload(dir: &Path, tenant: TenantId, data: &[u8]) -> std::io::Result<PathBuf> {
    let tenant_dir = dir.join(tenant.to_string());
    tokio::fs::create_dir_all(&tenant_dir).await?;

    let filename = format!(
        "{}_{}.jpg",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        Uuid::new_v4().simple()
    );
    let path = tenant_dir.join(filename);
    tokio::fs::write(&path, data).await?;

    info!("💾 Saved photo {:?} ({} bytes)", path, data.len());
    Ok(path)
}

/// Remove photos that will never be used. Failures are only logged.
pub async fn discard(paths: &[String]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove photo {}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_upload_layout() {
        let dir = tempfile::tempdir().unwrap();
        let first = save_upload(dir.path(), 3, b"jpeg-1").await.unwrap();
        let second = save_upload(dir.path(), 3, b"jpeg-2").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(first.parent().unwrap(), dir.path().join("3"));
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(".jpg"));
        assert!(name.contains('_'));
        assert_eq!(std::fs::read(&second).unwrap(), b"jpeg-2");
    }

    #[tokio::test]
    async fn test_discard() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_upload(dir.path(), 1, b"x").await.unwrap();
        let path = path.to_string_lossy().into_owned();

        discard(std::slice::from_ref(&path)).await;
        assert!(!Path::new(&path).exists());
    }
}
