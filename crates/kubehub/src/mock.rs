//! In-memory engine API for tests: applies real RFC 6902 semantics and mimics
//! the operator's uniqueness check on filter names.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use mdai_core::{MdaiError, MdaiResult, PatchDocument, PatchOp};
use serde_json::Value as Json;

use crate::tiers::ConfigMapApi;
use crate::{Engine, EngineApi};

type Interleave = Box<dyn FnMut(&mut Json) + Send>;

#[derive(Default)]
pub struct MockEngine {
    state: Mutex<Option<Json>>,
    version: Mutex<u64>,
    patches: Mutex<Vec<PatchDocument>>,
    conflicts: Mutex<u32>,
    // runs once per forced conflict, as if another writer got in first
    interleave: Mutex<Option<Interleave>>,
    // runs once, right after the next read, without any conflict signal
    after_read: Mutex<Option<Interleave>>,
    crds: Mutex<BTreeSet<String>>,
    deleted_crds: Mutex<Vec<String>>,
    creates: Mutex<u32>,
    replaces: Mutex<u32>,
}

impl MockEngine {
    /// Engine with a single collector and the given filter list (`None` = field absent).
    pub fn with_filters(filters: Option<Json>) -> Self {
        let mut collector = serde_json::json!({ "name": "gateway", "enabled": true, "measureVolumes": false, "spec": { "config": "receivers: {}\n" } });
        if let Some(f) = filters {
            collector["telemetryFiltering"] = serde_json::json!({ "filters": f });
        }
        let raw = serde_json::json!({
            "apiVersion": "mydecisive.ai/v1",
            "kind": "MyDecisiveEngine",
            "metadata": { "name": "mydecisiveengine-sample-1", "namespace": "mdai", "resourceVersion": "1" },
            "spec": { "telemetryModule": { "collectors": [collector] } }
        });
        let m = Self::default();
        if let Ok(mut s) = m.state.lock() { *s = Some(raw); }
        if let Ok(mut v) = m.version.lock() { *v = 1; }
        m
    }

    pub fn empty() -> Self { Self::default() }

    pub fn conflict_times(self, n: u32) -> Self {
        if let Ok(mut c) = self.conflicts.lock() { *c = n; }
        self
    }

    pub fn interleave(self, f: impl FnMut(&mut Json) + Send + 'static) -> Self {
        if let Ok(mut slot) = self.interleave.lock() { *slot = Some(Box::new(f)); }
        self
    }

    /// Let another writer change the resource right after the next `get_engine`.
    pub fn race_after_read(self, f: impl FnMut(&mut Json) + Send + 'static) -> Self {
        if let Ok(mut slot) = self.after_read.lock() { *slot = Some(Box::new(f)); }
        self
    }

    pub fn with_crds(self, names: &[&str]) -> Self {
        if let Ok(mut c) = self.crds.lock() { c.extend(names.iter().map(|s| s.to_string())); }
        self
    }

    pub fn patches(&self) -> Vec<PatchDocument> { self.patches.lock().map(|p| p.clone()).unwrap_or_default() }
    pub fn deleted_crds(&self) -> Vec<String> { self.deleted_crds.lock().map(|p| p.clone()).unwrap_or_default() }
    pub fn creates(&self) -> u32 { self.creates.lock().map(|c| *c).unwrap_or_default() }
    pub fn replaces(&self) -> u32 { self.replaces.lock().map(|c| *c).unwrap_or_default() }

    pub fn current(&self) -> Option<Engine> { self.state.lock().ok().and_then(|s| s.clone()).map(Engine::from_raw) }

    pub fn filter_names(&self) -> Vec<String> {
        self.current()
            .and_then(|e| e.filters().ok().flatten())
            .map(|fs| fs.into_iter().map(|f| f.name).collect())
            .unwrap_or_default()
    }

    fn lock_err() -> MdaiError { MdaiError::Internal("mock poisoned".into()) }

    fn bump(&self, doc: &mut Json) -> MdaiResult<()> {
        let mut v = self.version.lock().map_err(|_| Self::lock_err())?;
        *v += 1;
        doc["metadata"]["resourceVersion"] = Json::String(v.to_string());
        Ok(())
    }

    fn check_unique(doc: &Json) -> MdaiResult<()> {
        let filters = &doc["spec"]["telemetryModule"]["collectors"][0]["telemetryFiltering"]["filters"];
        let mut seen = BTreeSet::new();
        for f in filters.as_array().into_iter().flatten() {
            let name = f["name"].as_str().unwrap_or_default();
            if !seen.insert(name.to_string()) {
                return Err(MdaiError::Validation(format!("admission webhook denied the request: Filter name {} is not unique", name)));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EngineApi for MockEngine {
    async fn get_engine(&self) -> MdaiResult<Engine> {
        let engine = self.current().ok_or_else(|| MdaiError::NotFound("MyDecisiveEngine mydecisiveengine-sample-1".into()))?;
        let racer = self.after_read.lock().map_err(|_| Self::lock_err())?.take();
        if let Some(mut f) = racer {
            let mut state = self.state.lock().map_err(|_| Self::lock_err())?;
            if let Some(doc) = state.as_mut() {
                f(doc);
                self.bump(doc)?;
            }
        }
        Ok(engine)
    }

    async fn list_engines(&self) -> MdaiResult<Vec<Engine>> { Ok(self.current().into_iter().collect()) }

    async fn patch_engine(&self, doc: &PatchDocument) -> MdaiResult<()> {
        self.patches.lock().map_err(|_| Self::lock_err())?.push(doc.clone());
        let mut state = self.state.lock().map_err(|_| Self::lock_err())?;
        let current = state.as_mut().ok_or_else(|| MdaiError::NotFound("MyDecisiveEngine mydecisiveengine-sample-1".into()))?;
        {
            let mut conflicts = self.conflicts.lock().map_err(|_| Self::lock_err())?;
            if *conflicts > 0 {
                *conflicts -= 1;
                if let Some(f) = self.interleave.lock().map_err(|_| Self::lock_err())?.as_mut() { f(current); }
                return Err(MdaiError::Conflict("the object has been modified".into()));
            }
        }
        let patch: json_patch::Patch = serde_json::from_value(doc.to_json())?;
        let mut next = current.clone();
        json_patch::patch(&mut next, &patch).map_err(|e| match doc.ops().get(e.operation).map(|o| o.op) {
            Some(PatchOp::Test) => MdaiError::Conflict(format!("testing value {} failed: test failed", e.path)),
            _ => MdaiError::Validation(format!("the server rejected our request: {}", e)),
        })?;
        Self::check_unique(&next)?;
        self.bump(&mut next)?;
        *current = next;
        Ok(())
    }

    async fn create_engine(&self, manifest: &Json) -> MdaiResult<()> {
        let mut state = self.state.lock().map_err(|_| Self::lock_err())?;
        if state.is_some() { return Err(MdaiError::Conflict("already exists".into())); }
        let mut doc = manifest.clone();
        self.bump(&mut doc)?;
        *state = Some(doc);
        *self.creates.lock().map_err(|_| Self::lock_err())? += 1;
        Ok(())
    }

    async fn replace_engine(&self, manifest: &Json) -> MdaiResult<()> {
        let mut state = self.state.lock().map_err(|_| Self::lock_err())?;
        let current = state.as_mut().ok_or_else(|| MdaiError::NotFound("engine".into()))?;
        if manifest["metadata"]["resourceVersion"] != current["metadata"]["resourceVersion"] {
            return Err(MdaiError::Conflict("resourceVersion mismatch".into()));
        }
        let mut doc = manifest.clone();
        self.bump(&mut doc)?;
        *current = doc;
        *self.replaces.lock().map_err(|_| Self::lock_err())? += 1;
        Ok(())
    }

    async fn delete_crd(&self, name: &str) -> MdaiResult<()> {
        self.deleted_crds.lock().map_err(|_| Self::lock_err())?.push(name.to_string());
        if self.crds.lock().map_err(|_| Self::lock_err())?.remove(name) { Ok(()) } else { Err(MdaiError::NotFound(format!("CRD {}", name))) }
    }
}

/// ConfigMaps held in memory, keyed by name.
#[derive(Default)]
pub struct MockConfigMaps {
    maps: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MockConfigMaps {
    pub fn raw(&self, name: &str, key: &str) -> Option<String> {
        self.maps.lock().ok().and_then(|m| m.get(name).and_then(|d| d.get(key).cloned()))
    }
}

#[async_trait::async_trait]
impl ConfigMapApi for MockConfigMaps {
    async fn data(&self, name: &str) -> MdaiResult<Option<BTreeMap<String, String>>> {
        Ok(self.maps.lock().map_err(|_| MockEngine::lock_err())?.get(name).cloned())
    }

    async fn merge(&self, name: &str, changes: &BTreeMap<String, Option<String>>) -> MdaiResult<()> {
        let mut maps = self.maps.lock().map_err(|_| MockEngine::lock_err())?;
        let data = maps.entry(name.to_string()).or_default();
        for (k, v) in changes {
            match v {
                Some(v) => { data.insert(k.clone(), v.clone()); }
                None => { data.remove(k); }
            }
        }
        Ok(())
    }
}
