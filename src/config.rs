use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use link_channel::event::CredentialBundle;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// The one configuration record this flow manages for a plugin instance.
///
/// The list owned by the config editor holds zero or one of these; the
/// `platform` discriminator is always the plugin alias. Fields the schema
/// editor manages but this flow does not interpret pass through `extra`
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfigRecord {
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_auth: Option<CredentialBundle>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PluginConfigRecord {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            google_auth: None,
            extra: Map::new(),
        }
    }

    /// A record counts as linked only with a complete credential bundle.
    pub fn is_linked(&self) -> bool {
        self.google_auth
            .as_ref()
            .is_some_and(|auth| auth.is_complete())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config save failed: {0}")]
    Transport(String),

    #[error("config save rejected with HTTP status {0}")]
    Rejected(u16),

    #[error("invalid config endpoint: {0}")]
    Endpoint(String),
}

/// Persists the full configuration list for one plugin.
///
/// Saving is fire-and-report: callers surface the outcome but never roll
/// back their in-memory record on failure.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn save(&self, plugin_id: &str, config: &[PluginConfigRecord]) -> Result<(), ConfigError>;
}

/// In-memory store. Keeps every save, so tests can assert how often and
/// with which payload persistence ran.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    saves: DashMap<String, Vec<Vec<PluginConfigRecord>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The most recently saved list for `plugin_id`, if any.
    pub fn last(&self, plugin_id: &str) -> Option<Vec<PluginConfigRecord>> {
        self.saves
            .get(plugin_id)
            .and_then(|history| history.last().cloned())
    }

    pub fn save_count(&self, plugin_id: &str) -> usize {
        self.saves
            .get(plugin_id)
            .map(|history| history.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn save(&self, plugin_id: &str, config: &[PluginConfigRecord]) -> Result<(), ConfigError> {
        self.saves
            .entry(plugin_id.to_string())
            .or_default()
            .push(config.to_vec());
        Ok(())
    }
}

/// Posts the full configuration list to the hosting UI's config editor.
#[derive(Debug, Clone)]
pub struct HttpConfigStore {
    http: reqwest::Client,
    base: Url,
}

impl HttpConfigStore {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    fn endpoint(&self, plugin_id: &str) -> Result<Url, ConfigError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ConfigError::Endpoint(self.base.to_string()))?
            .pop_if_empty()
            .extend(["config-editor", "plugin", plugin_id]);
        Ok(url)
    }
}

#[async_trait]
impl ConfigStore for HttpConfigStore {
    async fn save(&self, plugin_id: &str, config: &[PluginConfigRecord]) -> Result<(), ConfigError> {
        let url = self.endpoint(plugin_id)?;
        debug!(%url, records = config.len(), "saving plugin config");
        let response = self
            .http
            .post(url)
            .json(&config)
            .send()
            .await
            .map_err(|err| ConfigError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ConfigError::Rejected(response.status().as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_uses_the_config_editor_wire_names() {
        let mut record = PluginConfigRecord::new("Nest-cam");
        record.google_auth = Some(CredentialBundle::new("T", "C"));

        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "platform": "Nest-cam",
                "googleAuth": { "issueToken": "T", "cookies": "C" }
            })
        );
    }

    #[test]
    fn test_unlinked_record_omits_the_auth_field() {
        let record = PluginConfigRecord::new("Nest-cam");
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({ "platform": "Nest-cam" })
        );
    }

    #[test]
    fn test_partial_bundle_does_not_count_as_linked() {
        let record: PluginConfigRecord = serde_json::from_value(json!({
            "platform": "Nest-cam",
            "googleAuth": { "issueToken": "T" }
        }))
        .unwrap();
        assert!(!record.is_linked());

        let record: PluginConfigRecord = serde_json::from_value(json!({
            "platform": "Nest-cam",
            "googleAuth": { "issueToken": "T", "cookies": "C" }
        }))
        .unwrap();
        assert!(record.is_linked());
    }

    #[test]
    fn test_extra_fields_survive_the_round_trip() {
        let wire = json!({
            "platform": "Nest-cam",
            "options": { "streamQuality": "high" }
        });
        let record: PluginConfigRecord = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(serde_json::to_value(&record).unwrap(), wire);
    }

    #[tokio::test]
    async fn test_memory_store_keeps_the_save_history() {
        let store = MemoryConfigStore::new();
        assert_eq!(store.save_count("p"), 0);
        assert_eq!(store.last("p"), None);

        let record = PluginConfigRecord::new("Nest-cam");
        store.save("p", std::slice::from_ref(&record)).await.unwrap();
        store.save("p", &[]).await.unwrap();

        assert_eq!(store.save_count("p"), 2);
        assert_eq!(store.last("p"), Some(vec![]));
    }

    #[test]
    fn test_endpoint_escapes_the_plugin_id() {
        let store = HttpConfigStore::new(Url::parse("http://localhost:8581/api/").unwrap());
        let url = store.endpoint("my plugin/beta").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8581/api/config-editor/plugin/my%20plugin%2Fbeta"
        );
    }
}
