use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One installable package. Read-only once the registry is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    pub release_name: String,
    /// `repo/chart` reference handed to the package manager.
    pub chart_ref: String,
    pub namespace: String,
    pub version: String,
    #[serde(default = "empty_values")]
    pub values: serde_yaml::Value,
    #[serde(default)]
    pub wait: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub create_namespace: bool,
    #[serde(default)]
    pub replace: bool,
}

fn empty_values() -> serde_yaml::Value { serde_yaml::Value::Mapping(Default::default()) }
fn default_timeout_secs() -> u64 { 120 }
fn default_true() -> bool { true }

impl ChartSpec {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }

    /// Chart name without the repository prefix (`jetstack/cert-manager` -> `cert-manager`).
    pub fn chart_name(&self) -> &str {
        self.chart_ref.rsplit('/').next().unwrap_or(&self.chart_ref)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    pub url: String,
}

/// Read-only view of an installed release as reported by the package manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub chart_name: String,
    pub chart_version: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub first_deployed: Option<String>,
    #[serde(default)]
    pub last_deployed: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    UpToDate,
    Outdated,
}

impl Freshness {
    pub fn symbol(self) -> &'static str {
        match self {
            Freshness::UpToDate => "✓",
            Freshness::Outdated => "✗",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutdatedRow {
    pub freshness: Freshness,
    pub name: String,
    /// Empty when no release exists for the chart.
    pub current: String,
    pub wanted: String,
}

/// Where tool invocations and API clients should point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubeTarget {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

impl KubeTarget {
    pub fn from_file(path: impl Into<PathBuf>) -> Self { Self { kubeconfig: Some(path.into()), context: None } }
}

/// Coordinates of the singleton engine custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespace: String,
    pub name: String,
}

impl Default for EngineRef {
    fn default() -> Self {
        Self {
            group: "mydecisive.ai".into(),
            version: "v1".into(),
            kind: "MyDecisiveEngine".into(),
            plural: "mydecisiveengines".into(),
            namespace: "mdai".into(),
            name: "mydecisiveengine-sample-1".into(),
        }
    }
}

impl EngineRef {
    pub fn api_version(&self) -> String { format!("{}/{}", self.group, self.version) }
}

/// JSON pointers into the engine resource.
pub mod paths {
    pub const FILTERING: &str = "/spec/telemetryModule/collectors/0/telemetryFiltering";
    pub const FILTERS: &str = "/spec/telemetryModule/collectors/0/telemetryFiltering/filters";
    pub const MEASURE_VOLUMES: &str = "/spec/telemetryModule/collectors/0/measureVolumes";
    pub const COLLECTOR_CONFIG: &str = "/spec/telemetryModule/collectors/0/spec/config";

    pub fn filter_at(index: usize) -> String { format!("{}/{}", FILTERS, index) }
    pub fn filter_append() -> String { format!("{}/-", FILTERS) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
}

/// An RFC 6902 document: applied atomically by the resource API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchDocument(pub Vec<PatchOperation>);

impl PatchDocument {
    pub fn add(path: impl Into<String>, value: Json) -> Self {
        Self(vec![PatchOperation { op: PatchOp::Add, path: path.into(), value: Some(value) }])
    }
    pub fn replace(path: impl Into<String>, value: Json) -> Self {
        Self(vec![PatchOperation { op: PatchOp::Replace, path: path.into(), value: Some(value) }])
    }
    pub fn remove(path: impl Into<String>) -> Self {
        Self(vec![PatchOperation { op: PatchOp::Remove, path: path.into(), value: None }])
    }

    /// Prefix the document with a `test` that filter `index` is still named `name`.
    /// The resource API carries no version for JSON patches, so this is what turns
    /// a shifted list into a failed write instead of an edit of the wrong filter.
    pub fn guard_filter(mut self, index: usize, name: &str) -> Self {
        let test = PatchOperation { op: PatchOp::Test, path: format!("{}/name", paths::filter_at(index)), value: Some(Json::String(name.to_string())) };
        self.0.insert(0, test);
        self
    }

    pub fn replace_filter(index: usize, name: &str, value: Json) -> Self {
        Self::replace(paths::filter_at(index), value).guard_filter(index, name)
    }

    pub fn remove_filter(index: usize, name: &str) -> Self {
        Self::remove(paths::filter_at(index)).guard_filter(index, name)
    }

    /// Sets the filter list to `[]`; appending to a null field fails server-side.
    pub fn bootstrap_filters() -> Self {
        Self::add(paths::FILTERING, serde_json::json!({ "filters": [] }))
    }

    pub fn ops(&self) -> &[PatchOperation] { &self.0 }

    /// True when every path is index-free, i.e. safe to resend unchanged after a conflict.
    pub fn is_resend_safe(&self) -> bool {
        self.0.iter().all(|o| match o.path.strip_prefix(paths::FILTERS) {
            Some(rest) => !rest.trim_start_matches('/').split('/').next().is_some_and(|seg| seg.parse::<usize>().is_ok()),
            None => true,
        })
    }

    pub fn to_json(&self) -> Json { serde_json::to_value(self).unwrap_or(Json::Null) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredServices {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelines: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_types: Option<Vec<String>>,
    #[serde(default)]
    pub service_name_pattern: String,
}

/// A named muting/filtering rule stored in the engine's filter list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFilter {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_pipelines: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_services: Option<FilteredServices>,
}

impl TelemetryFilter {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), enabled: true, ..Default::default() } }

    pub fn description(mut self, d: impl Into<String>) -> Self { self.description = d.into(); self }
    pub fn enabled(mut self, on: bool) -> Self { self.enabled = on; self }

    pub fn muting(mut self, pipelines: Vec<String>) -> Self { self.muted_pipelines = Some(pipelines); self }

    pub fn for_services(mut self, pattern: impl Into<String>, pipelines: Vec<String>, telemetry_types: Vec<String>) -> Self {
        self.filtered_services = Some(FilteredServices {
            pipelines: (!pipelines.is_empty()).then_some(pipelines),
            telemetry_types: (!telemetry_types.is_empty()).then_some(telemetry_types),
            service_name_pattern: pattern.into(),
        });
        self
    }

    pub fn pipelines(&self) -> Vec<String> {
        if let Some(p) = &self.muted_pipelines { return p.clone(); }
        self.filtered_services.as_ref().and_then(|fs| fs.pipelines.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_document_serializes_rfc6902() {
        let doc = PatchDocument::bootstrap_filters();
        let s = serde_json::to_string(&doc).unwrap();
        assert_eq!(s, r#"[{"op":"add","path":"/spec/telemetryModule/collectors/0/telemetryFiltering","value":{"filters":[]}}]"#);
        let rm = serde_json::to_string(&PatchDocument::remove(paths::filter_at(2))).unwrap();
        assert!(!rm.contains("value"), "rm={}", rm);
    }

    #[test]
    fn index_paths_are_not_resend_safe() {
        assert!(PatchDocument::add(paths::filter_append(), Json::Null).is_resend_safe());
        assert!(PatchDocument::replace(paths::MEASURE_VOLUMES, Json::Bool(true)).is_resend_safe());
        assert!(!PatchDocument::remove(paths::filter_at(0)).is_resend_safe());
    }

    #[test]
    fn index_edits_are_guarded_by_name() {
        let doc = PatchDocument::remove_filter(1, "b");
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v[0], serde_json::json!({ "op": "test", "path": format!("{}/1/name", paths::FILTERS), "value": "b" }));
        assert_eq!(v[1], serde_json::json!({ "op": "remove", "path": paths::filter_at(1) }));
        let doc = PatchDocument::replace_filter(0, "a", serde_json::json!({ "name": "a" }));
        assert_eq!(doc.ops().iter().map(|o| o.op).collect::<Vec<_>>(), vec![PatchOp::Test, PatchOp::Replace]);
    }

    #[test]
    fn filter_wire_shape_is_camel_case() {
        let f = TelemetryFilter::new("f1").description("drop noisy").for_services("checkout-.*", vec![], vec!["logs".into()]);
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["filteredServices"]["serviceNamePattern"], "checkout-.*");
        assert_eq!(v["filteredServices"]["telemetryTypes"][0], "logs");
        assert!(v["filteredServices"].get("pipelines").is_none());
        assert!(v.get("mutedPipelines").is_none());
    }

    #[test]
    fn chart_name_strips_repo() {
        let spec: ChartSpec = serde_yaml::from_str("releaseName: a\nchartRef: jetstack/cert-manager\nnamespace: n\nversion: 1.0.0\n").unwrap();
        assert_eq!(spec.chart_name(), "cert-manager");
        assert!(spec.create_namespace);
        assert_eq!(spec.timeout_secs, 120);
    }
}
