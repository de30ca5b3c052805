//! Typed operations against a controller's HTTP endpoints.
//!
//! Thin wrappers over [`HostGateway`]: every call is keyed by the
//! host's bare address and inherits the gateway's lane, timeout, and
//! retry contract.

use std::sync::Arc;

use serde_json::Value;

use super::error::ApiError;
use super::gateway::{HostGateway, RequestOptions};
use crate::models::{Controller, Document, Patch};

/// Client for the shared document and the narrower endpoints.
#[derive(Clone)]
pub struct DocumentClient {
    gateway: Arc<HostGateway>,
}

impl DocumentClient {
    pub fn new(gateway: Arc<HostGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<HostGateway> {
        &self.gateway
    }

    /// Fetches the full shared document from one host.
    pub async fn get_document(&self, host: &str) -> Result<Document, ApiError> {
        self.get_document_with(host, &RequestOptions::default()).await
    }

    /// Fetches the document with per-request overrides (the sync cycle
    /// uses a tighter deadline than interactive calls).
    pub async fn get_document_with(
        &self,
        host: &str,
        opts: &RequestOptions,
    ) -> Result<Document, ApiError> {
        let value = self
            .gateway
            .execute(host, reqwest::Method::GET, "data", None, opts)
            .await?;
        serde_json::from_value(value).map_err(|e| ApiError::InvalidBody(e.to_string()))
    }

    /// Sends a partial update to one host's document.
    pub async fn patch_document(&self, host: &str, patch: &Patch) -> Result<(), ApiError> {
        self.gateway.post(host, "data", &patch.as_value()).await?;
        Ok(())
    }

    /// Reads the controller directory from a host: `GET /hosts?all`.
    pub async fn get_hosts(&self, host: &str, all: bool) -> Result<Vec<Controller>, ApiError> {
        let value = self.gateway.get(host, &format!("hosts?all={}", all)).await?;
        let hosts = value
            .get("hosts")
            .cloned()
            .ok_or_else(|| ApiError::InvalidBody("missing hosts field".to_string()))?;
        serde_json::from_value(hosts).map_err(|e| ApiError::InvalidBody(e.to_string()))
    }

    pub async fn get_info(&self, host: &str) -> Result<Value, ApiError> {
        self.gateway.get(host, "info").await
    }

    pub async fn get_color(&self, host: &str) -> Result<Value, ApiError> {
        self.gateway.get(host, "color").await
    }

    pub async fn post_color(&self, host: &str, color: &Value) -> Result<(), ApiError> {
        self.gateway.post(host, "color", color).await?;
        Ok(())
    }

    pub async fn get_config(&self, host: &str) -> Result<Value, ApiError> {
        self.gateway.get(host, "config").await
    }

    pub async fn post_config(&self, host: &str, config: &Value) -> Result<(), ApiError> {
        self.gateway.post(host, "config", config).await?;
        Ok(())
    }

    /// Sends a system command (reboot, factory reset, …) to one host.
    pub async fn post_system(&self, host: &str, command: &Value) -> Result<(), ApiError> {
        self.gateway.post(host, "system", command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::gateway::GatewayPolicy;
    use crate::models::{Collection, Preset, SyncLock};
    use crate::testutil::MockController;
    use serde_json::json;
    use std::time::Duration;

    fn client() -> DocumentClient {
        DocumentClient::new(Arc::new(HostGateway::new(GatewayPolicy {
            request_timeout: Duration::from_secs(2),
            max_retries: 1,
            retry_base_delay: Duration::from_millis(20),
        })))
    }

    fn preset(id: &str, name: &str, ts: i64) -> Preset {
        Preset {
            id: id.into(),
            name: name.into(),
            ts,
            color: json!({"r": 1, "g": 2, "b": 3}),
            ..Preset::default()
        }
    }

    #[tokio::test]
    async fn test_get_document_parses_typed_fields() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| {
            doc.presets.push(preset("p1", "dusk", 50));
            doc.sync_lock = Some(SyncLock::held_by("c9", 1234));
        });

        let doc = client().get_document(&mock.host()).await.unwrap();
        assert_eq!(doc.presets.len(), 1);
        assert_eq!(doc.presets[0].name, "dusk");
        assert_eq!(doc.sync_lock, Some(SyncLock::held_by("c9", 1234)));
    }

    #[tokio::test]
    async fn test_patch_document_replaces_entry_by_id() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| doc.presets.push(preset("p1", "old", 10)));

        let patch = Patch::replace(Collection::Presets, "p1", &preset("p1", "new", 20)).unwrap();
        client().patch_document(&mock.host(), &patch).await.unwrap();

        let doc = mock.document();
        assert_eq!(doc.presets.len(), 1);
        assert_eq!(doc.presets[0].name, "new");
    }

    #[tokio::test]
    async fn test_patch_document_appends_new_entry() {
        let mock = MockController::spawn().await;

        let patch = Patch::append(Collection::Presets, &preset("p2", "added", 30)).unwrap();
        client().patch_document(&mock.host(), &patch).await.unwrap();

        assert_eq!(mock.document().presets.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_id_surfaces_bad_selector() {
        let mock = MockController::spawn().await;

        let patch = Patch::remove(Collection::Presets, "ghost");
        let err = client()
            .patch_document(&mock.host(), &patch)
            .await
            .unwrap_err();
        assert!(err.is_bad_selector(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_get_hosts_unwraps_directory() {
        let mock = MockController::spawn().await;
        mock.set_hosts(vec![
            Controller::new("c1", "lamp-1", "10.0.0.1"),
            Controller::new("c2", "lamp-2", "10.0.0.2"),
        ]);

        let hosts = client().get_hosts(&mock.host(), true).await.unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[1].hostname, "lamp-2");
    }
}
