//! Proxy Context
//!
//! Owns everything the control plane shares between the monitor, the
//! admin surfaces and client sessions: the backend registry, the
//! sharding configuration and the object store.

use std::sync::Arc;

use serde_json::Value;

use crate::backend::{BackendRegistry, BackendState, BackendType};
use crate::config::WolfGateConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::sharding::ShardingConfig;
use crate::store::{open_store, ObjectStore};

/// Name of the persisted backend list object
pub const BACKENDS_OBJECT: &str = "backends";

/// Settings the context needs after startup
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub sharding_enabled: bool,
    pub sharding_object: String,
    pub retry: RetryPolicy,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            sharding_enabled: false,
            sharding_object: crate::sharding::SHARDING_OBJECT.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared control plane state
pub struct ProxyContext {
    registry: Arc<BackendRegistry>,
    sharding: Arc<ShardingConfig>,
    store: Arc<dyn ObjectStore>,
    settings: ContextSettings,
}

impl ProxyContext {
    pub fn new(
        registry: Arc<BackendRegistry>,
        sharding: Arc<ShardingConfig>,
        store: Arc<dyn ObjectStore>,
        settings: ContextSettings,
    ) -> Self {
        Self {
            registry,
            sharding,
            store,
            settings,
        }
    }

    /// Build the context from configuration
    ///
    /// A persisted "backends" object takes precedence over the lists in the
    /// config file. The sharding configuration, when enabled, must load
    /// cleanly or startup fails.
    pub async fn from_config(config: &WolfGateConfig) -> Result<Self> {
        let store = open_store(&config.store)?;
        let registry = Arc::new(BackendRegistry::new(
            config.backends.partition_mode,
            config.pool_limits(),
        ));

        let (rw, ro) = match store.query_object(BACKENDS_OBJECT).await? {
            Some(saved) => {
                tracing::info!("Loading backends from the persisted '{}' object", BACKENDS_OBJECT);
                (spec_list(&saved, "rw")?, spec_list(&saved, "ro")?)
            }
            None => (config.backends.rw.clone(), config.backends.ro.clone()),
        };
        load_backends(&registry, &rw, BackendType::Rw).await;
        load_backends(&registry, &ro, BackendType::Ro).await;

        let settings = ContextSettings {
            sharding_enabled: config.sharding.enabled,
            sharding_object: config.sharding.object.clone(),
            retry: config.retry,
        };
        let sharding = Arc::new(ShardingConfig::new(config.backends.partition_mode));
        let ctx = Self::new(registry, sharding, store, settings);

        if ctx.settings.sharding_enabled {
            match ctx.store.query_object(&ctx.settings.sharding_object).await? {
                Some(root) => ctx.sharding.load(&root, ctx.registry.group_count())?,
                None => tracing::warn!(
                    "Sharding enabled but no '{}' object is stored yet",
                    ctx.settings.sharding_object
                ),
            }
        }

        Ok(ctx)
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn sharding(&self) -> &Arc<ShardingConfig> {
        &self.sharding
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Backend index for a write, waking long-DOWN backends first
    pub fn route_write(&self) -> Option<usize> {
        self.registry.wake_down_backends();
        self.registry.pick_rw()
    }

    /// Backend index for a read, waking long-DOWN backends first
    pub fn route_read(&self) -> Option<usize> {
        self.registry.wake_down_backends();
        self.registry.pick_ro()
    }
}

fn spec_list(saved: &Value, key: &str) -> Result<Vec<String>> {
    match saved.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Config(format!("backends.{}: expected strings, got {}", key, item)))
            })
            .collect(),
        Some(other) => Err(Error::Config(format!("backends.{}: expected an array, got {}", key, other))),
    }
}

/// Add configured backends; bad entries are logged and skipped
async fn load_backends(registry: &BackendRegistry, specs: &[String], kind: BackendType) {
    for spec in specs {
        if let Err(e) = registry.add_async(spec, kind, BackendState::Unknown).await {
            tracing::error!("Skipping {} backend {}: {}", kind, spec, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir, extra: &str) -> WolfGateConfig {
        let toml = format!(
            r#"
[node]
id = "gate-1"

[monitor]
enabled = false

[backends]
rw = ["127.0.0.1:3306@g1"]
ro = ["127.0.0.1:3307@g1", "127.0.0.1:3308#2@g1"]

[store]
kind = "file"
path = "{}"
{}
"#,
            dir.path().display(),
            extra
        );
        WolfGateConfig::from_str(&toml).unwrap()
    }

    #[tokio::test]
    async fn test_loads_backends_from_config() {
        let dir = TempDir::new().unwrap();
        let ctx = ProxyContext::from_config(&config(&dir, "")).await.unwrap();

        let registry = ctx.registry();
        assert_eq!(registry.count(), 3);
        assert_eq!(registry.ro_count(), 2);
        assert!(registry.priority_mode());
        assert_eq!(registry.group_master("g1").unwrap().name(), "127.0.0.1:3306");
        assert_eq!(ctx.route_write(), Some(0));
    }

    #[tokio::test]
    async fn test_persisted_backends_win() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, "");
        assert_eq!(cfg.store.kind, StoreKind::File);
        let store = open_store(&cfg.store).unwrap();
        store
            .write_object(BACKENDS_OBJECT, &json!({"rw": ["127.0.0.1:4000"], "ro": []}))
            .await
            .unwrap();

        let ctx = ProxyContext::from_config(&cfg).await.unwrap();
        assert_eq!(ctx.registry().count(), 1);
        assert_eq!(ctx.registry().get(0).unwrap().name(), "127.0.0.1:4000");
    }

    #[tokio::test]
    async fn test_invalid_sharding_fails_startup() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, "\n[sharding]\nenabled = true\n");
        let store = open_store(&cfg.store).unwrap();
        store
            .write_object("sharding", &json!({"vdb": [{"id": 1, "type": "int", "method": "hash", "num": 4,
                "partitions": {"g1": [0, 1]}}]}))
            .await
            .unwrap();

        assert!(ProxyContext::from_config(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_backend_entry_skipped() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, "");
        cfg.backends.ro.push("127.0.0.1:3306".into());
        let ctx = ProxyContext::from_config(&cfg).await.unwrap();
        assert_eq!(ctx.registry().count(), 3);
    }
}
