//! MDAI kubehub: client construction, the engine custom-resource API and storage tiers.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config,
};
use mdai_core::{EngineRef, KubeTarget, MdaiError, MdaiResult, PatchDocument, TelemetryFilter};
use serde_json::Value as Json;
use tracing::{debug, info};

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod tiers;

pub use tiers::{ConfigMapApi, KubeConfigMaps, StorageTier, TierStore};

/// Build a client for `target`; falls back to the usual inference when no file is given.
pub async fn get_kube_client(target: &KubeTarget) -> Result<Client> {
    let options = KubeConfigOptions { context: target.context.clone(), ..Default::default() };
    let config = match (&target.kubeconfig, &target.context) {
        (Some(path), _) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &options).await.context("loading kubeconfig")?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options).await.context("loading kubeconfig")?,
        (None, None) => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

/// Snapshot of the engine resource as last read.
#[derive(Debug, Clone, PartialEq)]
pub struct Engine {
    pub name: String,
    pub namespace: String,
    pub resource_version: Option<String>,
    pub raw: Json,
}

impl Engine {
    pub fn from_raw(raw: Json) -> Self {
        let meta = &raw["metadata"];
        Self {
            name: meta["name"].as_str().unwrap_or_default().to_string(),
            namespace: meta["namespace"].as_str().unwrap_or_default().to_string(),
            resource_version: meta["resourceVersion"].as_str().map(String::from),
            raw,
        }
    }

    fn collector(&self) -> &Json { &self.raw["spec"]["telemetryModule"]["collectors"][0] }

    /// `None` when the filter list field is absent or null.
    pub fn filters(&self) -> MdaiResult<Option<Vec<TelemetryFilter>>> {
        match &self.collector()["telemetryFiltering"]["filters"] {
            Json::Null => Ok(None),
            v => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }

    pub fn filter_index(&self, name: &str) -> MdaiResult<Option<usize>> {
        Ok(self.filters()?.and_then(|fs| fs.iter().position(|f| f.name == name)))
    }

    pub fn measure_volumes(&self) -> Option<bool> { self.collector()["measureVolumes"].as_bool() }

    pub fn collector_config(&self) -> Option<&str> { self.collector()["spec"]["config"].as_str() }
}

/// Resource API collaborator for the singleton engine and its CRDs.
#[async_trait::async_trait]
pub trait EngineApi: Send + Sync {
    async fn get_engine(&self) -> MdaiResult<Engine>;
    async fn list_engines(&self) -> MdaiResult<Vec<Engine>>;
    async fn patch_engine(&self, doc: &PatchDocument) -> MdaiResult<()>;
    async fn create_engine(&self, manifest: &Json) -> MdaiResult<()>;
    /// Full replace; `manifest` must carry the live resourceVersion.
    async fn replace_engine(&self, manifest: &Json) -> MdaiResult<()>;
    async fn delete_crd(&self, name: &str) -> MdaiResult<()>;
}

/// Translate kube errors into the classes callers branch on.
pub fn map_kube_err(e: kube::Error, what: &str) -> MdaiError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => MdaiError::NotFound(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 409 => MdaiError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 422 && is_failed_test(&ae.message) => MdaiError::Conflict(ae.message),
        kube::Error::Api(ae) if matches!(ae.code, 400 | 422) || matches!(ae.reason.as_str(), "Invalid" | "BadRequest") => MdaiError::Validation(ae.message),
        // admission webhooks deny with 403
        kube::Error::Api(ae) if ae.code == 403 && ae.message.contains("denied the request") => MdaiError::Validation(ae.message),
        other => MdaiError::Internal(format!("{}: {}", what, other)),
    }
}

/// The apiserver reports a failed or inapplicable JSON Patch `test` op as a bare 422.
fn is_failed_test(message: &str) -> bool {
    message.contains("testing value") || message.contains("test failed") || message.contains("test operation does not apply")
}

pub struct KubeEngineApi {
    engines: Api<DynamicObject>,
    crds: Api<CustomResourceDefinition>,
    engine: EngineRef,
}

impl KubeEngineApi {
    pub fn new(client: Client, engine: EngineRef) -> Self {
        let gvk = GroupVersionKind::gvk(&engine.group, &engine.version, &engine.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &engine.plural);
        Self {
            engines: Api::namespaced_with(client.clone(), &engine.namespace, &ar),
            crds: Api::all(client),
            engine,
        }
    }

    pub async fn connect(target: &KubeTarget, engine: EngineRef) -> Result<Self> {
        let client = get_kube_client(target).await?;
        info!(ns = %engine.namespace, name = %engine.name, "kube client ready");
        Ok(Self::new(client, engine))
    }

    fn to_object(manifest: &Json) -> MdaiResult<DynamicObject> { Ok(serde_json::from_value(manifest.clone())?) }
}

#[async_trait::async_trait]
impl EngineApi for KubeEngineApi {
    async fn get_engine(&self) -> MdaiResult<Engine> {
        let obj = self.engines.get(&self.engine.name).await.map_err(|e| map_kube_err(e, &format!("{} {}", self.engine.kind, self.engine.name)))?;
        Ok(Engine::from_raw(serde_json::to_value(obj)?))
    }

    async fn list_engines(&self) -> MdaiResult<Vec<Engine>> {
        let list = self.engines.list(&ListParams::default()).await.map_err(|e| map_kube_err(e, &self.engine.plural))?;
        list.items.into_iter().map(|o| -> MdaiResult<Engine> { Ok(Engine::from_raw(serde_json::to_value(o)?)) }).collect()
    }

    async fn patch_engine(&self, doc: &PatchDocument) -> MdaiResult<()> {
        let t0 = Instant::now();
        let patch: json_patch::Patch = serde_json::from_value(doc.to_json())?;
        self.engines
            .patch(&self.engine.name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
            .map_err(|e| map_kube_err(e, &format!("{} {}", self.engine.kind, self.engine.name)))?;
        debug!(ops = doc.ops().len(), took_ms = %t0.elapsed().as_millis(), "engine patched");
        Ok(())
    }

    async fn create_engine(&self, manifest: &Json) -> MdaiResult<()> {
        let obj = Self::to_object(manifest)?;
        self.engines.create(&PostParams::default(), &obj).await.map_err(|e| map_kube_err(e, "creating engine"))?;
        Ok(())
    }

    async fn replace_engine(&self, manifest: &Json) -> MdaiResult<()> {
        let obj = Self::to_object(manifest)?;
        self.engines.replace(&self.engine.name, &PostParams::default(), &obj).await.map_err(|e| map_kube_err(e, "replacing engine"))?;
        Ok(())
    }

    async fn delete_crd(&self, name: &str) -> MdaiResult<()> {
        self.crds.delete(name, &DeleteParams::default()).await.map_err(|e| map_kube_err(e, &format!("CRD {}", name)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_err(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: message.into(), reason: reason.into(), code })
    }

    #[test]
    fn kube_errors_map_to_classes() {
        assert!(map_kube_err(api_err(404, "NotFound", "gone"), "x").is_not_found());
        assert!(map_kube_err(api_err(409, "Conflict", "rv changed"), "x").is_conflict());
        assert!(matches!(map_kube_err(api_err(422, "Invalid", "Filter name a is not unique"), "x"), MdaiError::Validation(m) if m.contains("not unique")));
        let guard = "the server rejected our request due to an error in our request (testing value /spec/telemetryModule/collectors/0/telemetryFiltering/filters/1/name failed: test failed)";
        assert!(map_kube_err(api_err(422, "Invalid", guard), "x").is_conflict());
        assert!(map_kube_err(api_err(422, "Invalid", "test operation does not apply: is missing path: /x"), "x").is_conflict());
        assert!(matches!(map_kube_err(api_err(403, "Forbidden", "admission webhook \"v\" denied the request: nope"), "x"), MdaiError::Validation(_)));
        assert!(matches!(map_kube_err(api_err(403, "Forbidden", "rbac says no"), "x"), MdaiError::Internal(_)));
    }

    #[test]
    fn engine_view_reads_collector_fields() {
        let e = Engine::from_raw(serde_json::json!({
            "metadata": {"name": "e", "namespace": "mdai", "resourceVersion": "7"},
            "spec": {"telemetryModule": {"collectors": [{
                "measureVolumes": true,
                "spec": {"config": "receivers: {}"},
                "telemetryFiltering": {"filters": [{"name": "a", "enabled": true}, {"name": "b"}]}
            }]}}
        }));
        assert_eq!(e.resource_version.as_deref(), Some("7"));
        assert_eq!(e.measure_volumes(), Some(true));
        assert_eq!(e.collector_config(), Some("receivers: {}"));
        assert_eq!(e.filter_index("b").unwrap(), Some(1));
        let bare = Engine::from_raw(serde_json::json!({"spec": {"telemetryModule": {"collectors": [{}]}}}));
        assert_eq!(bare.filters().unwrap(), None);
    }
}
