//! `helm` binary as the package-manager collaborator. Repository files are handled
//! natively; release operations shell out with `-o json`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use mdai_core::{ChartSpec, KubeTarget, MdaiError, MdaiResult, Release, RepoEntry};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::repo::{RepoFile, RepoWorkspace};
use crate::{split_chart_label, PackageManager};

pub struct HelmCli {
    bin: PathBuf,
    target: KubeTarget,
    repo_config: PathBuf,
    repo_cache: PathBuf,
    http: reqwest::Client,
    // keeps the scoped repo files alive as long as the client
    _workspace: Option<Arc<RepoWorkspace>>,
}

impl HelmCli {
    /// Client with its own run-scoped repository config and cache.
    pub fn scoped(target: KubeTarget) -> MdaiResult<Self> {
        let ws = RepoWorkspace::new()?;
        let (config, cache) = (ws.config_path(), ws.cache_dir());
        Ok(Self::with_repo_paths(target, config, cache).keep(Arc::new(ws)))
    }

    pub fn with_repo_paths(target: KubeTarget, repo_config: PathBuf, repo_cache: PathBuf) -> Self {
        Self {
            bin: PathBuf::from(std::env::var("MDAI_HELM_BIN").unwrap_or_else(|_| "helm".to_string())),
            target,
            repo_config,
            repo_cache,
            http: reqwest::Client::new(),
            _workspace: None,
        }
    }

    fn keep(mut self, ws: Arc<RepoWorkspace>) -> Self { self._workspace = Some(ws); self }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "--repository-config".to_string(), self.repo_config.display().to_string(),
            "--repository-cache".to_string(), self.repo_cache.display().to_string(),
        ];
        if let Some(kc) = &self.target.kubeconfig { args.extend(["--kubeconfig".to_string(), kc.display().to_string()]); }
        if let Some(ctx) = &self.target.context { args.extend(["--kube-context".to_string(), ctx.clone()]); }
        args
    }

    async fn run(&self, args: &[String]) -> MdaiResult<String> {
        let mut full: Vec<String> = args.to_vec();
        full.extend(self.base_args());
        debug!(bin = %self.bin.display(), args = ?args, "helm exec");
        let out = Command::new(&self.bin)
            .args(&full)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MdaiError::Setup(format!("spawning {}: {}", self.bin.display(), e)))?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        Err(classify_failure(args.first().map(String::as_str).unwrap_or(""), stderr))
    }

    fn values_file(spec: &ChartSpec) -> MdaiResult<tempfile::NamedTempFile> {
        let mut f = tempfile::Builder::new().prefix("mdai-values-").suffix(".yaml").tempfile()?;
        f.write_all(serde_yaml::to_string(&spec.values)?.as_bytes())?;
        f.flush()?;
        Ok(f)
    }

    fn chart_args(verb: &str, spec: &ChartSpec, values: &Path) -> Vec<String> {
        let mut args = vec![
            verb.to_string(), spec.release_name.clone(), spec.chart_ref.clone(),
            "--namespace".into(), spec.namespace.clone(),
            "--version".into(), spec.version.clone(),
            "--values".into(), values.display().to_string(),
            "--timeout".into(), format!("{}s", spec.timeout_secs),
            "--output".into(), "json".into(),
        ];
        if spec.wait { args.push("--wait".into()); }
        if verb == "install" {
            if spec.create_namespace { args.push("--create-namespace".into()); }
            if spec.replace { args.push("--replace".into()); }
        }
        args
    }

    async fn chart_op(&self, verb: &str, spec: &ChartSpec) -> Result<Release> {
        let values = Self::values_file(spec)?;
        let out = self.run(&Self::chart_args(verb, spec, values.path())).await?;
        let rel: ReleaseJson = serde_json::from_str(&out).with_context(|| format!("parsing helm {} output", verb))?;
        Ok(rel.into_release())
    }
}

/// Only helm's missing-release error means "no release"; other "not found" text
/// (charts, repos, namespaces) is a real failure.
fn classify_failure(verb: &str, stderr: String) -> MdaiError {
    if stderr.contains("release: not found") {
        return MdaiError::NotFound(stderr);
    }
    MdaiError::Internal(format!("helm {} failed: {}", verb, stderr))
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
    namespace: String,
    #[serde(default)]
    updated: String,
    chart: String,
    #[serde(default)]
    app_version: String,
}

#[derive(Debug, Deserialize)]
struct HistoryItem {
    #[serde(default)]
    updated: String,
    chart: String,
    #[serde(default)]
    app_version: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseJson {
    name: String,
    namespace: String,
    #[serde(default)]
    info: ReleaseInfo,
    #[serde(default)]
    chart: ChartJson,
}

#[derive(Debug, Default, Deserialize)]
struct ReleaseInfo {
    #[serde(default)]
    first_deployed: Option<String>,
    #[serde(default)]
    last_deployed: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartJson {
    #[serde(default)]
    metadata: ChartMeta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    app_version: String,
}

impl ReleaseJson {
    fn into_release(self) -> Release {
        Release {
            name: self.name,
            namespace: self.namespace,
            chart_name: self.chart.metadata.name,
            chart_version: self.chart.metadata.version,
            app_version: self.chart.metadata.app_version,
            first_deployed: self.info.first_deployed,
            last_deployed: self.info.last_deployed,
        }
    }
}

fn parse_list(out: &str) -> Result<Vec<Release>> {
    let items: Vec<ListItem> = serde_json::from_str(out).context("parsing helm list output")?;
    Ok(items.into_iter().map(|i| {
        let (chart_name, chart_version) = split_chart_label(&i.chart);
        Release { name: i.name, namespace: i.namespace, chart_name, chart_version, app_version: i.app_version, first_deployed: None, last_deployed: Some(i.updated) }
    }).collect())
}

fn parse_history(release: &str, namespace: &str, out: &str) -> MdaiResult<Vec<Release>> {
    let mut items: Vec<HistoryItem> = serde_json::from_str(out)?;
    // helm prints oldest first
    items.reverse();
    let first = items.last().map(|i| i.updated.clone());
    Ok(items.into_iter().map(|i| {
        let (chart_name, chart_version) = split_chart_label(&i.chart);
        Release {
            name: release.to_string(),
            namespace: namespace.to_string(),
            chart_name,
            chart_version,
            app_version: i.app_version,
            first_deployed: first.clone(),
            last_deployed: Some(i.updated),
        }
    }).collect())
}

#[async_trait::async_trait]
impl PackageManager for HelmCli {
    async fn load_repo_file(&self) -> MdaiResult<RepoFile> {
        match tokio::fs::read_to_string(&self.repo_config).await {
            Ok(raw) => RepoFile::parse(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(MdaiError::NotFound(self.repo_config.display().to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn download_index(&self, repo: &RepoEntry) -> Result<()> {
        let url = format!("{}/index.yaml", repo.url.trim_end_matches('/'));
        let body = self.http.get(&url).send().await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()
            .with_context(|| format!("GET {}", url))?
            .bytes().await?;
        // fail early on a page that is not an index
        let _: serde_yaml::Value = serde_yaml::from_slice(&body).with_context(|| format!("{} is not a valid chart index", url))?;
        let path = self.repo_cache.join(format!("{}-index.yaml", repo.name));
        tokio::fs::write(&path, &body).await.with_context(|| format!("writing {}", path.display()))?;
        debug!(repo = %repo.name, bytes = body.len(), "index cached");
        Ok(())
    }

    async fn write_repo_file(&self, file: &RepoFile) -> Result<()> {
        let mut file = file.clone();
        file.generated = chrono::Utc::now().to_rfc3339();
        if let Some(dir) = self.repo_config.parent() { tokio::fs::create_dir_all(dir).await?; }
        tokio::fs::write(&self.repo_config, serde_yaml::to_string(&file)?).await
            .with_context(|| format!("writing {}", self.repo_config.display()))?;
        Ok(())
    }

    async fn history(&self, release: &str, namespace: &str, max: usize) -> MdaiResult<Vec<Release>> {
        let args: Vec<String> = ["history", release, "--namespace", namespace, "--max", &max.to_string(), "--output", "json"]
            .iter().map(|s| s.to_string()).collect();
        let out = self.run(&args).await?;
        parse_history(release, namespace, &out)
    }

    async fn list_releases(&self) -> Result<Vec<Release>> {
        let args: Vec<String> = ["list", "--all-namespaces", "--output", "json"].iter().map(|s| s.to_string()).collect();
        let out = self.run(&args).await?;
        parse_list(&out)
    }

    async fn install(&self, spec: &ChartSpec) -> Result<Release> { self.chart_op("install", spec).await }

    async fn upgrade(&self, spec: &ChartSpec) -> Result<Release> { self.chart_op("upgrade", spec).await }

    async fn uninstall(&self, release: &str, namespace: &str) -> MdaiResult<()> {
        let args: Vec<String> = ["uninstall", release, "--namespace", namespace].iter().map(|s| s.to_string()).collect();
        match self.run(&args).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(release = %release, ns = %namespace, error = %e, "helm uninstall failed");
                Err(e)
            }
        }
    }
}
