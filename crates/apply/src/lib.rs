//! MDAI apply: JSON Patch against the engine custom resource under bounded
//! conflict retry, plus the filter, module and collector-config mutations built on it.

#![forbid(unsafe_code)]

use std::future::Future;
use std::str::FromStr;
use std::time::Instant;

use mdai_core::model::paths;
use mdai_core::{MdaiError, MdaiResult, PatchDocument, TelemetryFilter};
use mdai_kubehub::{Engine, EngineApi};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub mod retry;
pub mod translate;

pub use retry::RetryPolicy;

/// Feature switches backed by a field of the engine's first collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Datalyzer,
}

impl Module {
    pub const ALL: [Module; 1] = [Module::Datalyzer];

    pub fn name(self) -> &'static str {
        match self { Module::Datalyzer => "datalyzer" }
    }

    fn path(self) -> &'static str {
        match self { Module::Datalyzer => paths::MEASURE_VOLUMES }
    }
}

impl FromStr for Module {
    type Err = MdaiError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Module::ALL.into_iter().find(|m| m.name() == s).ok_or_else(|| MdaiError::Validation(format!("module {} is not supported", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOutcome {
    Created,
    Updated,
}

/// Every write to the engine goes through here; attempts for one call are sequential.
pub struct Patcher<'a> {
    api: &'a dyn EngineApi,
    policy: RetryPolicy,
}

impl<'a> Patcher<'a> {
    pub fn new(api: &'a dyn EngineApi) -> Self { Self { api, policy: RetryPolicy::from_env() } }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self { self.policy = policy; self }

    async fn retry_conflicts<T, F, Fut>(&self, what: &str, mut attempt: F) -> MdaiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MdaiResult<T>>,
    {
        let t0 = Instant::now();
        let mut backoff = self.policy.backoff();
        let mut last = String::new();
        for n in 1..=self.policy.steps {
            counter!("patch_attempts", 1u64);
            match attempt().await {
                Ok(v) => {
                    counter!("patch_ok", 1u64);
                    histogram!("patch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    debug!(what, attempts = n, took_ms = %t0.elapsed().as_millis(), "engine write ok");
                    return Ok(v);
                }
                Err(MdaiError::Conflict(msg)) => {
                    counter!("patch_conflicts", 1u64);
                    warn!(what, attempt = n, error = %msg, "conflict; retrying");
                    last = msg;
                    if n < self.policy.steps { tokio::time::sleep(backoff.next_delay()).await; }
                }
                Err(e) => {
                    counter!("patch_err", 1u64);
                    return Err(e);
                }
            }
        }
        counter!("patch_err", 1u64);
        Err(MdaiError::ConflictExhausted { attempts: self.policy.steps, last })
    }

    /// Send `doc` unchanged, resending it on conflict. Only index-free documents
    /// (appends, fixed fields) are accepted; index-based edits go through [`Patcher::patch_with`].
    pub async fn patch(&self, doc: &PatchDocument) -> MdaiResult<()> {
        if !doc.is_resend_safe() {
            return Err(MdaiError::Internal("index-based patch must be rebuilt per attempt".into()));
        }
        self.retry_conflicts("patch", || self.api.patch_engine(doc)).await
    }

    /// Re-read the engine and rebuild the document on every attempt, so list indexes
    /// are never stale. Index edits carry a `test` guard; a failed guard comes back
    /// as Conflict and triggers the rebuild. `build` returning `None` means there is nothing to change.
    pub async fn patch_with<F>(&self, build: F) -> MdaiResult<()>
    where
        F: Fn(&Engine) -> MdaiResult<Option<PatchDocument>> + Send + Sync,
    {
        let build = &build;
        let api = self.api;
        self.retry_conflicts("patch_with", move || async move {
            let engine = api.get_engine().await?;
            match build(&engine)? {
                Some(doc) => api.patch_engine(&doc).await,
                None => Ok(()),
            }
        })
        .await
    }

    /// Create the filter list when it is absent. Re-checked on every attempt so a
    /// competing writer's first filter is never wiped by a second bootstrap.
    pub async fn ensure_filter_list(&self) -> MdaiResult<()> {
        self.patch_with(|engine| {
            if engine.filters()?.is_some() { return Ok(None); }
            info!("initializing telemetry filter list");
            Ok(Some(PatchDocument::bootstrap_filters()))
        })
        .await
    }

    pub async fn list_filters(&self) -> MdaiResult<Vec<TelemetryFilter>> {
        Ok(self.api.get_engine().await?.filters()?.unwrap_or_default())
    }

    /// Append a filter. Name uniqueness is enforced remotely.
    pub async fn add_filter(&self, filter: &TelemetryFilter) -> MdaiResult<()> {
        self.ensure_filter_list().await?;
        let doc = PatchDocument::add(paths::filter_append(), serde_json::to_value(filter)?);
        self.patch(&doc).await.map_err(|e| translate::filter_rejection(e, filter))?;
        info!(filter = %filter.name, "filter added");
        Ok(())
    }

    /// Replace the same-named filter in place, or append when there is none.
    pub async fn mute(&self, filter: &TelemetryFilter) -> MdaiResult<()> {
        self.ensure_filter_list().await?;
        let value = serde_json::to_value(filter)?;
        self.patch_with(|engine| {
            Ok(Some(match engine.filter_index(&filter.name)? {
                Some(i) => PatchDocument::replace_filter(i, &filter.name, value.clone()),
                None => PatchDocument::add(paths::filter_append(), value.clone()),
            }))
        })
        .await
        .map_err(|e| translate::filter_rejection(e, filter))?;
        info!(filter = %filter.name, "pipelines muted");
        Ok(())
    }

    pub async fn set_filter_enabled(&self, name: &str, enabled: bool) -> MdaiResult<()> {
        self.patch_with(|engine| {
            let (i, mut f) = find_filter(engine, name)?;
            f.enabled = enabled;
            Ok(Some(PatchDocument::replace_filter(i, name, serde_json::to_value(f)?)))
        })
        .await?;
        info!(filter = %name, enabled, "filter toggled");
        Ok(())
    }

    pub async fn remove_filter(&self, name: &str) -> MdaiResult<()> {
        self.patch_with(|engine| {
            let (i, _) = find_filter(engine, name)?;
            Ok(Some(PatchDocument::remove_filter(i, name)))
        })
        .await?;
        info!(filter = %name, "filter removed");
        Ok(())
    }

    /// Disable the filter, or delete it when `remove` is set.
    pub async fn unmute(&self, name: &str, remove: bool) -> MdaiResult<()> {
        if remove { self.remove_filter(name).await } else { self.set_filter_enabled(name, false).await }
    }

    pub async fn set_module(&self, module: Module, enabled: bool) -> MdaiResult<()> {
        self.patch(&PatchDocument::replace(module.path(), Json::Bool(enabled))).await?;
        info!(module = module.name(), enabled, "module toggled");
        Ok(())
    }

    pub async fn collector_config(&self) -> MdaiResult<String> {
        let engine = self.api.get_engine().await?;
        engine.collector_config().map(String::from).ok_or_else(|| MdaiError::NotFound("collector config".into()))
    }

    /// Replace the collector config. The document must be valid YAML.
    pub async fn update_collector_config(&self, config: &str) -> MdaiResult<()> {
        serde_yaml::from_str::<serde_yaml::Value>(config).map_err(|e| MdaiError::Validation(format!("collector config is not valid yaml: {}", e)))?;
        self.patch(&PatchDocument::add(paths::COLLECTOR_CONFIG, Json::String(config.to_string()))).await?;
        info!(bytes = config.len(), "collector config updated");
        Ok(())
    }

    /// Create the engine from `manifest`, or replace it carrying the live resourceVersion.
    pub async fn apply_manifest(&self, manifest: &str) -> MdaiResult<ManifestOutcome> {
        let desired: Json = serde_yaml::from_str(manifest)?;
        let api = self.api;
        let desired = &desired;
        self.retry_conflicts("apply_manifest", move || async move {
            match api.get_engine().await {
                Err(MdaiError::NotFound(_)) => {
                    api.create_engine(desired).await?;
                    Ok(ManifestOutcome::Created)
                }
                Ok(live) => {
                    let mut next = desired.clone();
                    next["metadata"]["resourceVersion"] = live.resource_version.map(Json::String).unwrap_or(Json::Null);
                    api.replace_engine(&next).await?;
                    Ok(ManifestOutcome::Updated)
                }
                Err(e) => Err(e),
            }
        })
        .await
    }
}

fn find_filter(engine: &Engine, name: &str) -> MdaiResult<(usize, TelemetryFilter)> {
    engine
        .filters()?
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .find(|(_, f)| f.name == name)
        .ok_or_else(|| MdaiError::NotFound(format!("filter {} not found", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdai_kubehub::mock::MockEngine;
    use serde_json::json;

    fn patcher(api: &MockEngine) -> Patcher<'_> { Patcher::new(api).with_policy(RetryPolicy::immediate(5)) }

    #[tokio::test]
    async fn bootstrap_precedes_first_append() {
        let api = MockEngine::with_filters(None);
        patcher(&api).add_filter(&TelemetryFilter::new("first").muting(vec!["logs".into()])).await.unwrap();
        let patches = api.patches();
        assert_eq!(patches.len(), 2, "patches={:?}", patches);
        assert_eq!(patches[0], PatchDocument::bootstrap_filters());
        assert_eq!(patches[1].ops()[0].path, paths::filter_append());
        assert_eq!(api.filter_names(), vec!["first"]);
    }

    #[tokio::test]
    async fn append_replayed_after_conflict_adds_once() {
        let api = MockEngine::with_filters(Some(json!([]))).conflict_times(1);
        patcher(&api).add_filter(&TelemetryFilter::new("only")).await.unwrap();
        assert_eq!(api.patches().len(), 2);
        assert_eq!(api.patches()[0], api.patches()[1]);
        assert_eq!(api.filter_names(), vec!["only"]);
    }

    #[tokio::test]
    async fn conflicts_exhaust_budget() {
        let api = MockEngine::with_filters(Some(json!([]))).conflict_times(10);
        let err = patcher(&api).set_module(Module::Datalyzer, true).await.unwrap_err();
        assert!(matches!(err, MdaiError::ConflictExhausted { attempts: 5, .. }), "err={:?}", err);
        assert_eq!(api.patches().len(), 5);
    }

    #[tokio::test]
    async fn index_patch_is_recomputed_after_concurrent_insert() {
        let api = MockEngine::with_filters(Some(json!([{ "name": "a", "enabled": true }, { "name": "b", "enabled": true }])))
            .conflict_times(1)
            .interleave(|doc| {
                // another writer prepends a filter between our read and write
                if let Some(list) = doc["spec"]["telemetryModule"]["collectors"][0]["telemetryFiltering"]["filters"].as_array_mut() {
                    list.insert(0, json!({ "name": "z", "enabled": true }));
                }
            });
        patcher(&api).remove_filter("b").await.unwrap();
        assert_eq!(api.filter_names(), vec!["z", "a"]);
        let sent: Vec<String> = api.patches().iter().filter_map(|p| p.ops().last().map(|o| o.path.clone())).collect();
        assert_eq!(sent, vec![paths::filter_at(1), paths::filter_at(2)]);
    }

    #[tokio::test]
    async fn silent_insert_after_read_fails_guard_and_rebuilds() {
        // no 409 here: the guard is the only thing that notices the shifted list
        let api = MockEngine::with_filters(Some(json!([{ "name": "a", "enabled": true }, { "name": "b", "enabled": true }])))
            .race_after_read(|doc| {
                if let Some(list) = doc["spec"]["telemetryModule"]["collectors"][0]["telemetryFiltering"]["filters"].as_array_mut() {
                    list.insert(0, json!({ "name": "z", "enabled": true }));
                }
            });
        patcher(&api).remove_filter("b").await.unwrap();
        assert_eq!(api.filter_names(), vec!["z", "a"]);
        let patches = api.patches();
        assert_eq!(patches.len(), 2, "patches={:?}", patches);
        assert_eq!(patches[0], PatchDocument::remove_filter(1, "b"));
        assert_eq!(patches[1], PatchDocument::remove_filter(2, "b"));
    }

    #[tokio::test]
    async fn toggle_after_silent_reorder_hits_the_named_filter() {
        let api = MockEngine::with_filters(Some(json!([{ "name": "a", "enabled": true }, { "name": "b", "enabled": true }])))
            .race_after_read(|doc| {
                if let Some(list) = doc["spec"]["telemetryModule"]["collectors"][0]["telemetryFiltering"]["filters"].as_array_mut() {
                    list.reverse();
                }
            });
        patcher(&api).set_filter_enabled("a", false).await.unwrap();
        let filters = api.current().unwrap().filters().unwrap().unwrap();
        assert_eq!(filters.iter().map(|f| (f.name.as_str(), f.enabled)).collect::<Vec<_>>(), vec![("b", true), ("a", false)]);
    }

    #[tokio::test]
    async fn index_patch_refuses_plain_resend() {
        let api = MockEngine::with_filters(Some(json!([])));
        let err = patcher(&api).patch(&PatchDocument::remove(paths::filter_at(0))).await.unwrap_err();
        assert!(matches!(err, MdaiError::Internal(_)));
        assert!(api.patches().is_empty());
    }

    #[tokio::test]
    async fn duplicate_name_is_translated() {
        let api = MockEngine::with_filters(Some(json!([{ "name": "dup", "enabled": true }])));
        let err = patcher(&api).add_filter(&TelemetryFilter::new("dup")).await.unwrap_err();
        match err {
            MdaiError::Validation(m) => assert_eq!(m, "filter name \"dup\" already exists in config"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn mute_replaces_existing_filter_in_place() {
        let api = MockEngine::with_filters(Some(json!([{ "name": "x" }, { "name": "m", "enabled": false }])));
        patcher(&api).mute(&TelemetryFilter::new("m").muting(vec!["metrics".into()])).await.unwrap();
        let filters = api.current().unwrap().filters().unwrap().unwrap();
        assert_eq!(filters.len(), 2);
        assert!(filters[1].enabled);
        assert_eq!(filters[1].muted_pipelines.as_deref(), Some(&["metrics".to_string()][..]));
    }

    #[tokio::test]
    async fn unmute_disables_or_removes() {
        let api = MockEngine::with_filters(Some(json!([{ "name": "m", "enabled": true }])));
        let p = patcher(&api);
        p.unmute("m", false).await.unwrap();
        assert!(!p.list_filters().await.unwrap()[0].enabled);
        p.unmute("m", true).await.unwrap();
        assert!(p.list_filters().await.unwrap().is_empty());
        let err = p.unmute("m", true).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("filter m not found"), "err={}", err);
    }

    #[tokio::test]
    async fn module_and_config_updates() {
        let api = MockEngine::with_filters(None);
        let p = patcher(&api);
        p.set_module("datalyzer".parse().unwrap(), true).await.unwrap();
        assert_eq!(api.current().unwrap().measure_volumes(), Some(true));
        assert!("tiered-storage".parse::<Module>().is_err());
        p.update_collector_config("receivers:\n  otlp: {}\n").await.unwrap();
        assert_eq!(p.collector_config().await.unwrap(), "receivers:\n  otlp: {}\n");
        let err = p.update_collector_config("receivers: [unclosed").await.unwrap_err();
        assert!(matches!(err, MdaiError::Validation(_)));
    }

    #[tokio::test]
    async fn manifest_creates_then_updates() {
        let api = MockEngine::empty();
        let p = patcher(&api);
        let manifest = "apiVersion: mydecisive.ai/v1\nkind: MyDecisiveEngine\nmetadata:\n  name: mydecisiveengine-sample-1\n  namespace: mdai\nspec: {}\n";
        assert_eq!(p.apply_manifest(manifest).await.unwrap(), ManifestOutcome::Created);
        assert_eq!(p.apply_manifest(manifest).await.unwrap(), ManifestOutcome::Updated);
        assert_eq!((api.creates(), api.replaces()), (1, 1));
    }
}
