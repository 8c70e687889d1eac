//! Immutable catalog of repositories, charts, CRDs and templates.
//!
//! Loaded once at startup (embedded YAML plus an optional values overlay directory)
//! and handed to components by reference.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_yaml::Value as Yaml;
use tracing::debug;

use crate::error::{MdaiError, MdaiResult};
use crate::model::{ChartSpec, EngineRef, RepoEntry};

const BUILTIN: &str = include_str!("../assets/registry.yaml");
const KIND_TEMPLATE: &str = include_str!("../assets/kind-cluster.yaml");
const ENGINE_MANIFEST: &str = include_str!("../assets/mdai-engine.yaml");

#[derive(Debug, Deserialize)]
struct RegistryFile {
    repositories: Vec<RepoEntry>,
    charts: BTreeMap<String, ChartSpec>,
    install: Vec<String>,
    #[serde(default)]
    demo: Vec<String>,
    #[serde(default)]
    crds: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    repos: Vec<RepoEntry>,
    charts: BTreeMap<String, ChartSpec>,
    install: Vec<String>,
    demo: Vec<String>,
    crds: Vec<String>,
    engine: EngineRef,
    kind_template: String,
    engine_manifest: String,
}

impl Registry {
    pub fn builtin() -> Result<Self> { Self::from_yaml(BUILTIN) }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(s).context("parsing chart registry")?;
        for key in file.install.iter().chain(file.demo.iter()) {
            if !file.charts.contains_key(key) {
                return Err(anyhow!("registry order references unknown chart {}", key));
            }
        }
        Ok(Self {
            repos: file.repositories,
            charts: file.charts,
            install: file.install,
            demo: file.demo,
            crds: file.crds,
            engine: EngineRef::default(),
            kind_template: KIND_TEMPLATE.to_string(),
            engine_manifest: ENGINE_MANIFEST.to_string(),
        })
    }

    /// Merge `<chart>-values.yaml` files from `dir` over the built-in values.
    pub fn with_values_overlay(mut self, dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow!("values overlay {} is not a directory", dir.display()));
        }
        for (key, spec) in self.charts.iter_mut() {
            let path = dir.join(format!("{}-values.yaml", key));
            if !path.exists() { continue; }
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let overlay: Yaml = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            merge_values(&mut spec.values, overlay);
            debug!(chart = %key, file = %path.display(), "values overlay applied");
        }
        Ok(self)
    }

    pub fn with_engine(mut self, engine: EngineRef) -> Self { self.engine = engine; self }

    pub fn chart(&self, key: &str) -> MdaiResult<&ChartSpec> {
        self.charts.get(key).ok_or_else(|| MdaiError::NotFound(format!("chart {} is not registered", key)))
    }

    pub fn repos(&self) -> &[RepoEntry] { &self.repos }
    pub fn install_order(&self) -> &[String] { &self.install }
    pub fn demo_charts(&self) -> &[String] { &self.demo }
    pub fn crds(&self) -> &[String] { &self.crds }
    pub fn engine(&self) -> &EngineRef { &self.engine }
    pub fn kind_template(&self) -> &str { &self.kind_template }
    pub fn engine_manifest(&self) -> &str { &self.engine_manifest }

    /// All registered charts, install order first, then the rest by key.
    pub fn charts(&self) -> impl Iterator<Item = (&str, &ChartSpec)> {
        let ordered = self.install.iter().chain(self.demo.iter());
        let rest = self.charts.keys().filter(move |k| !self.install.contains(k) && !self.demo.contains(k));
        ordered.chain(rest).filter_map(move |k| self.charts.get(k).map(|s| (k.as_str(), s)))
    }
}

fn merge_values(base: &mut Yaml, overlay: Yaml) {
    match (base, overlay) {
        (Yaml::Mapping(b), Yaml::Mapping(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(slot) => merge_values(slot, v),
                    None => { b.insert(k, v); }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_consistent() {
        let r = Registry::builtin().unwrap();
        assert_eq!(r.install_order().len(), 7);
        assert_eq!(r.install_order()[0], "cert-manager");
        assert_eq!(r.repos().iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["mydecisive", "prometheus-community", "jetstack", "opentelemetry"]);
        assert_eq!(r.chart("mdai-operator").unwrap().release_name, "mydecisive-engine-operator");
        assert_eq!(r.chart("opentelemetry-demo").unwrap().timeout_secs, 300);
        assert!(r.chart("nope").unwrap_err().is_not_found());
        assert_eq!(r.charts().count(), 8);
        assert!(r.engine_manifest().contains("MyDecisiveEngine"));
    }

    #[test]
    fn unknown_order_entry_is_rejected() {
        let y = "repositories: []\ncharts: {}\ninstall: [ghost]\n";
        let e = Registry::from_yaml(y).unwrap_err().to_string();
        assert!(e.contains("unknown chart ghost"), "e={}", e);
    }

    #[test]
    fn overlay_deep_merges_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cert-manager-values.yaml"), "crds:\n  keep: true\nreplicaCount: 2\n").unwrap();
        let r = Registry::builtin().unwrap().with_values_overlay(dir.path()).unwrap();
        let v = &r.chart("cert-manager").unwrap().values;
        assert_eq!(v["crds"]["enabled"], Yaml::Bool(true));
        assert_eq!(v["crds"]["keep"], Yaml::Bool(true));
        assert_eq!(v["replicaCount"], Yaml::Number(2.into()));
        // untouched chart keeps its defaults
        assert_eq!(r.chart("prometheus").unwrap().values, Yaml::Mapping(Default::default()));
    }
}
