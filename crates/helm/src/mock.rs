//! In-memory package manager for tests.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use mdai_core::{ChartSpec, MdaiError, MdaiResult, Release, RepoEntry};

use crate::repo::RepoFile;
use crate::PackageManager;

#[derive(Debug, Default)]
pub struct MockHelm {
    releases: Mutex<Vec<Release>>,
    repo_file: Mutex<Option<RepoFile>>,
    downloads: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    fail_download: Option<String>,
    fail_history: Option<String>,
    fail_install: HashSet<String>,
}

impl MockHelm {
    pub fn with_release(self, r: Release) -> Self {
        if let Ok(mut v) = self.releases.lock() { v.push(r); }
        self
    }

    pub fn failing_download(mut self, repo: &str) -> Self { self.fail_download = Some(repo.to_string()); self }
    pub fn failing_history(mut self, msg: &str) -> Self { self.fail_history = Some(msg.to_string()); self }
    /// Make install/upgrade of `release` fail.
    pub fn failing_install(mut self, release: &str) -> Self { self.fail_install.insert(release.to_string()); self }

    pub fn set_repo_file(&self, f: RepoFile) {
        if let Ok(mut slot) = self.repo_file.lock() { *slot = Some(f); }
    }

    pub fn repo_file(&self) -> Option<RepoFile> { self.repo_file.lock().ok().and_then(|f| f.clone()) }
    pub fn downloads(&self) -> Vec<String> { self.downloads.lock().map(|d| d.clone()).unwrap_or_default() }
    pub fn calls(&self) -> Vec<String> { self.calls.lock().map(|c| c.clone()).unwrap_or_default() }
    pub fn releases(&self) -> Vec<Release> { self.releases.lock().map(|r| r.clone()).unwrap_or_default() }

    fn record(&self, call: String) {
        if let Ok(mut c) = self.calls.lock() { c.push(call); }
    }

    fn upsert(&self, spec: &ChartSpec) -> Result<Release> {
        if self.fail_install.contains(&spec.release_name) {
            return Err(anyhow!("timed out waiting for the condition"));
        }
        let rel = Release {
            name: spec.release_name.clone(),
            namespace: spec.namespace.clone(),
            chart_name: spec.chart_name().to_string(),
            chart_version: spec.version.clone(),
            ..Default::default()
        };
        let mut v = self.releases.lock().map_err(|_| anyhow!("poisoned"))?;
        v.retain(|r| !(r.name == rel.name && r.namespace == rel.namespace));
        v.push(rel.clone());
        Ok(rel)
    }
}

#[async_trait::async_trait]
impl PackageManager for MockHelm {
    async fn load_repo_file(&self) -> MdaiResult<RepoFile> {
        self.repo_file().ok_or_else(|| MdaiError::NotFound("repositories.yaml".into()))
    }

    async fn download_index(&self, repo: &RepoEntry) -> Result<()> {
        if let Ok(mut d) = self.downloads.lock() { d.push(repo.name.clone()); }
        if self.fail_download.as_deref() == Some(repo.name.as_str()) {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }

    async fn write_repo_file(&self, file: &RepoFile) -> Result<()> {
        self.set_repo_file(file.clone());
        Ok(())
    }

    async fn history(&self, release: &str, namespace: &str, max: usize) -> MdaiResult<Vec<Release>> {
        self.record(format!("history {} {}", release, namespace));
        if let Some(msg) = &self.fail_history { return Err(MdaiError::Internal(msg.clone())); }
        let found: Vec<Release> = self.releases().into_iter().filter(|r| r.name == release).take(max).collect();
        if found.is_empty() { return Err(MdaiError::NotFound(format!("release {}", release))); }
        Ok(found)
    }

    async fn list_releases(&self) -> Result<Vec<Release>> { Ok(self.releases()) }

    async fn install(&self, spec: &ChartSpec) -> Result<Release> {
        self.record(format!("install {}", spec.release_name));
        self.upsert(spec)
    }

    async fn upgrade(&self, spec: &ChartSpec) -> Result<Release> {
        self.record(format!("upgrade {}", spec.release_name));
        self.upsert(spec)
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> MdaiResult<()> {
        self.record(format!("uninstall {} {}", release, namespace));
        let mut v = self.releases.lock().map_err(|_| MdaiError::Internal("poisoned".into()))?;
        let before = v.len();
        v.retain(|r| r.name != release);
        if v.len() == before { return Err(MdaiError::NotFound(format!("release {}", release))); }
        Ok(())
    }
}
