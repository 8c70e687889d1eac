//! Storage tiers: one JSON document per key in the `tiered-storage` ConfigMap.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use mdai_core::{MdaiError, MdaiResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::map_kube_err;

pub const TIERED_STORAGE: &str = "tiered-storage";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTier {
    pub tier: String,
    pub capacity: String,
    pub retention_period: String,
    pub format: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pipelines: Vec<String>,
    pub location: String,
}

impl StorageTier {
    fn validate(&self, key: &str) -> MdaiResult<()> {
        let required = [
            ("key", key),
            ("tier", self.tier.as_str()),
            ("capacity", self.capacity.as_str()),
            ("retention period", self.retention_period.as_str()),
            ("format", self.format.as_str()),
            ("location", self.location.as_str()),
        ];
        match required.iter().find(|(_, v)| v.trim().is_empty()) {
            Some((field, _)) => Err(MdaiError::Validation(format!("{} cannot be empty", field))),
            None => Ok(()),
        }
    }
}

/// Key/value access to ConfigMaps in one namespace.
#[async_trait::async_trait]
pub trait ConfigMapApi: Send + Sync {
    /// `None` when the ConfigMap does not exist.
    async fn data(&self, name: &str) -> MdaiResult<Option<BTreeMap<String, String>>>;
    /// Merge `changes` into `.data`; `None` deletes the key. Creates the ConfigMap when absent.
    async fn merge(&self, name: &str, changes: &BTreeMap<String, Option<String>>) -> MdaiResult<()>;
}

pub struct KubeConfigMaps {
    api: Api<ConfigMap>,
}

impl KubeConfigMaps {
    pub fn new(client: Client, namespace: &str) -> Self { Self { api: Api::namespaced(client, namespace) } }
}

#[async_trait::async_trait]
impl ConfigMapApi for KubeConfigMaps {
    async fn data(&self, name: &str) -> MdaiResult<Option<BTreeMap<String, String>>> {
        let cm = self.api.get_opt(name).await.map_err(|e| map_kube_err(e, &format!("configmap {}", name)))?;
        Ok(cm.map(|c| c.data.unwrap_or_default()))
    }

    async fn merge(&self, name: &str, changes: &BTreeMap<String, Option<String>>) -> MdaiResult<()> {
        let body = serde_json::json!({ "data": changes });
        match self.api.patch(name, &PatchParams::default(), &Patch::Merge(&body)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let data: BTreeMap<String, String> = changes.iter().filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v))).collect();
                let cm = ConfigMap { metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() }, data: Some(data), ..Default::default() };
                self.api.create(&PostParams::default(), &cm).await.map_err(|e| map_kube_err(e, &format!("creating configmap {}", name)))?;
                debug!(configmap = %name, "created");
                Ok(())
            }
            Err(e) => Err(map_kube_err(e, &format!("configmap {}", name))),
        }
    }
}

pub struct TierStore<'a> {
    api: &'a dyn ConfigMapApi,
}

impl<'a> TierStore<'a> {
    pub fn new(api: &'a dyn ConfigMapApi) -> Self { Self { api } }

    /// Tiers sorted by key. A missing ConfigMap reads as no tiers.
    pub async fn list(&self) -> MdaiResult<Vec<(String, StorageTier)>> {
        let data = self.api.data(TIERED_STORAGE).await?.unwrap_or_default();
        data.into_iter()
            .map(|(k, raw)| {
                let tier = serde_json::from_str(&raw).map_err(|e| MdaiError::Validation(format!("tiered storage {} is not valid: {}", k, e)))?;
                Ok((k, tier))
            })
            .collect()
    }

    /// Add or overwrite the tier stored under `key`.
    pub async fn add(&self, key: &str, tier: &StorageTier) -> MdaiResult<()> {
        tier.validate(key)?;
        let raw = serde_json::to_string(tier)?;
        self.api.merge(TIERED_STORAGE, &BTreeMap::from([(key.to_string(), Some(raw))])).await?;
        info!(key, tier = %tier.tier, "storage tier added");
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> MdaiResult<()> {
        let present = self.api.data(TIERED_STORAGE).await?.is_some_and(|d| d.contains_key(key));
        if !present {
            return Err(MdaiError::NotFound(format!("tiered storage {} not found in configmap", key)));
        }
        self.api.merge(TIERED_STORAGE, &BTreeMap::from([(key.to_string(), None)])).await?;
        info!(key, "storage tier removed");
        Ok(())
    }
}

/// The tier as one JSON object with its key inlined.
pub fn tier_json(key: &str, tier: &StorageTier) -> Json {
    let mut v = serde_json::to_value(tier).unwrap_or(Json::Null);
    v["key"] = Json::String(key.to_string());
    v
}
