//! QR image rendering for pairing codes.

use std::path::{Path, PathBuf};

use qrcode::render::svg;
use qrcode::QrCode;

use crate::store::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("failed to encode QR payload: {0}")]
    Encode(#[from] qrcode::types::QrError),
    #[error("failed to write QR image: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the tenant's current QR image lives.
pub fn qr_path(dir: &Path, tenant: TenantId) -> PathBuf {
    dir.join(format!("qr_{tenant}.svg"))
}

pub fn render_svg(payload: &str) -> Result<String, QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    Ok(code
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .quiet_zone(true)
        .build())
}

/// Render `payload` and overwrite the tenant's QR image.
pub async fn write_qr(dir: &Path, tenant: TenantId, payload: &str) -> Result<PathBuf, QrError> {
    let image = render_svg(payload)?;
    tokio::fs::create_dir_all(dir).await?;
    let path = qr_path(dir, tenant);
    tokio::fs::write(&path, image).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_svg() {
        let svg = render_svg("2@abc,def,ghi").unwrap();
        assert!(svg.contains("<svg"));
    }

    #[tokio::test]
    async fn test_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_qr(dir.path(), 7, "first").await.unwrap();
        let second = write_qr(dir.path(), 7, "second-code").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.file_name().unwrap(), "qr_7.svg");
        assert!(std::fs::read_to_string(second).unwrap().contains("<svg"));
    }
}
