//! Operations exposed to the dealership admin panel.

use tracing::info;

use crate::store::TenantId;
use crate::whatsapp::{ConnectionError, ConnectionManager, PairResult, SessionStatus};

pub const DEFAULT_TEST_MESSAGE: &str =
    "Halo! Ini adalah pesan test dari Auto LMK Bot. Bot WhatsApp Anda sudah berhasil terhubung! 🎉";

#[derive(Clone)]
pub struct AdminApi {
    manager: ConnectionManager,
}

impl AdminApi {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn pairing_status(&self, tenant: TenantId) -> SessionStatus {
        self.manager.status(tenant).await
    }

    pub async fn initiate_pairing(&self, tenant: TenantId) -> Result<PairResult, ConnectionError> {
        info!("Admin requested pairing for tenant {}", tenant);
        self.manager.pair_tenant(tenant).await
    }

    pub async fn disconnect(&self, tenant: TenantId) -> Result<(), ConnectionError> {
        info!("Admin requested disconnect for tenant {}", tenant);
        self.manager.disconnect(tenant).await
    }

    /// Send a connectivity check to `phone`. Uses the default text when
    /// `message` is `None` or blank.
    pub async fn send_test_message(
        &self,
        tenant: TenantId,
        phone: &str,
        message: Option<&str>,
    ) -> Result<(), ConnectionError> {
        if phone.trim().is_empty() {
            return Err(ConnectionError::InvalidRecipient(phone.to_string()));
        }
        let text = message.filter(|m| !m.trim().is_empty()).unwrap_or(DEFAULT_TEST_MESSAGE);
        self.manager.send_message(tenant, phone, text).await
    }

    /// The latest QR image as SVG bytes.
    pub async fn qr_image(&self, tenant: TenantId) -> Result<Vec<u8>, ConnectionError> {
        let path = self
            .manager
            .qr_image_path(tenant)
            .await
            .ok_or(ConnectionError::NotFound(tenant))?;

        tokio::fs::read(&path).await.map_err(|source| ConnectionError::MediaRead {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::whatsapp::{DeviceIdentity, ManagerOptions, SessionState, Transport, TransportFactory};

    struct NoFactory;

    impl TransportFactory for NoFactory {
        fn create(&self, _tenant: TenantId, _device: DeviceIdentity) -> Arc<dyn Transport> {
            unreachable!("no session should be created")
        }
    }

    fn api() -> AdminApi {
        AdminApi::new(ConnectionManager::new(Arc::new(NoFactory), ManagerOptions::default()))
    }

    #[tokio::test]
    async fn test_status_of_unknown_tenant() {
        let status = api().pairing_status(7).await;
        assert_eq!(status.state, SessionState::Unpaired);
        assert!(status.phone.is_none());
        assert!(!status.qr_available);
    }

    #[tokio::test]
    async fn test_empty_phone_rejected() {
        let err = api().send_test_message(7, "  ", None).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidRecipient(_)));
    }

    #[tokio::test]
    async fn test_test_message_needs_connection() {
        let err = api().send_test_message(7, "081234567890", None).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected(7)));
    }

    #[tokio::test]
    async fn test_qr_before_pairing() {
        let err = api().qr_image(7).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotFound(7)));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_tenant() {
        let err = api().disconnect(7).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotFound(7)));
    }
}
