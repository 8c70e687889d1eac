//! Repository registration against helm's `repositories.yaml`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use mdai_core::{MdaiError, MdaiResult, Progress, RepoEntry};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::PackageManager;

/// On-disk repository registry in helm's format. Unknown keys survive a rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoFile {
    #[serde(default, rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub generated: String,
    #[serde(default)]
    pub repositories: Vec<RepoFileEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoFileEntry {
    pub name: String,
    pub url: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl RepoFile {
    pub fn parse(raw: &str) -> MdaiResult<Self> {
        if raw.trim().is_empty() { return Ok(Self::default()); }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn has(&self, name: &str) -> bool { self.repositories.iter().any(|r| r.name == name) }

    /// Insert or overwrite by name.
    pub fn update(&mut self, repo: &RepoEntry) {
        match self.repositories.iter_mut().find(|r| r.name == repo.name) {
            Some(r) => r.url = repo.url.clone(),
            None => self.repositories.push(RepoFileEntry { name: repo.name.clone(), url: repo.url.clone(), extra: BTreeMap::new() }),
        }
    }
}

/// Run-scoped repository config and index cache, removed on drop.
#[derive(Debug)]
pub struct RepoWorkspace {
    dir: TempDir,
}

impl RepoWorkspace {
    pub fn new() -> MdaiResult<Self> {
        let dir = tempfile::Builder::new().prefix("mdai-helm-").tempdir()?;
        std::fs::create_dir_all(dir.path().join("cache"))?;
        Ok(Self { dir })
    }

    pub fn config_path(&self) -> PathBuf { self.dir.path().join("repositories.yaml") }
    pub fn cache_dir(&self) -> PathBuf { self.dir.path().join("cache") }
}

/// Make sure every repo is registered; stop at the first failure.
pub async fn ensure_repos(pm: &dyn PackageManager, repos: &[RepoEntry], progress: &dyn Progress) -> Result<()> {
    for repo in repos {
        let mut file = match pm.load_repo_file().await {
            Ok(f) => f,
            Err(MdaiError::NotFound(_)) => RepoFile::default(),
            Err(e) => return Err(e).context("loading repository file"),
        };
        if file.has(&repo.name) {
            debug!(repo = %repo.name, "repo present");
            progress.message(&format!("repo {} already exists. skipping.", repo.name)).await;
            continue;
        }
        pm.download_index(repo).await.with_context(|| format!("downloading index for repo {} ({})", repo.name, repo.url))?;
        file.update(repo);
        pm.write_repo_file(&file).await.with_context(|| format!("writing repository file for {}", repo.name))?;
        info!(repo = %repo.name, url = %repo.url, "repo added");
        progress.message(&format!("added repo {}", repo.name)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHelm;
    use mdai_core::{channel, ProgressEvent};

    fn repos() -> Vec<RepoEntry> {
        vec![
            RepoEntry { name: "jetstack".into(), url: "https://charts.jetstack.io".into() },
            RepoEntry { name: "opentelemetry".into(), url: "https://open-telemetry.github.io/opentelemetry-helm-charts".into() },
        ]
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_repos_get_added() {
        let helm = MockHelm::default();
        let (em, stream) = channel();
        let collect = tokio::spawn(stream.collect());
        ensure_repos(&helm, &repos(), &em).await.unwrap();
        drop(em);
        let evs = collect.await.unwrap();
        assert_eq!(evs, vec![ProgressEvent::Message("added repo jetstack".into()), ProgressEvent::Message("added repo opentelemetry".into())]);
        let file = helm.repo_file().unwrap();
        assert!(file.has("jetstack") && file.has("opentelemetry"));
        assert_eq!(helm.downloads(), vec!["jetstack".to_string(), "opentelemetry".to_string()]);
    }

    #[tokio::test]
    async fn known_repo_is_skipped_without_download() {
        let helm = MockHelm::default();
        let mut file = RepoFile::default();
        file.update(&repos()[0]);
        helm.set_repo_file(file);
        ensure_repos(&helm, &repos(), &mdai_core::LogProgress).await.unwrap();
        assert_eq!(helm.downloads(), vec!["opentelemetry".to_string()]);
    }

    #[tokio::test]
    async fn download_failure_stops_the_loop() {
        let helm = MockHelm::default().failing_download("jetstack");
        let err = ensure_repos(&helm, &repos(), &mdai_core::LogProgress).await.unwrap_err();
        assert!(format!("{:#}", err).contains("downloading index for repo jetstack"), "err={:#}", err);
        assert!(helm.repo_file().is_none());
        assert_eq!(helm.downloads(), vec!["jetstack".to_string()]);
    }

    #[test]
    fn repo_file_keeps_unknown_fields() {
        let raw = "apiVersion: \"\"\ngenerated: x\nrepositories:\n- name: a\n  url: https://a\n  insecure_skip_tls_verify: false\n";
        let mut f = RepoFile::parse(raw).unwrap();
        f.update(&RepoEntry { name: "b".into(), url: "https://b".into() });
        let out = serde_yaml::to_string(&f).unwrap();
        assert!(out.contains("insecure_skip_tls_verify: false"), "out={}", out);
        assert!(RepoFile::parse("  \n").unwrap().repositories.is_empty());
    }
}
