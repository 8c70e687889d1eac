//! MDAI helm: repository registration, install-or-upgrade reconciliation and
//! the outdated report, on top of a package-manager collaborator.

#![forbid(unsafe_code)]

use anyhow::Result;
use mdai_core::{ChartSpec, MdaiResult, Release, RepoEntry};

pub mod cli;
pub mod reconcile;
pub mod repo;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use cli::HelmCli;
pub use reconcile::{ChartAction, ChartReconciler};
pub use repo::{ensure_repos, RepoFile, RepoFileEntry, RepoWorkspace};

/// Package-manager collaborator: repository file primitives plus release primitives
/// keyed by release name and namespace.
#[async_trait::async_trait]
pub trait PackageManager: Send + Sync {
    /// `NotFound` when the repository file does not exist yet.
    async fn load_repo_file(&self) -> MdaiResult<RepoFile>;
    async fn download_index(&self, repo: &RepoEntry) -> Result<()>;
    async fn write_repo_file(&self, file: &RepoFile) -> Result<()>;

    /// Newest-first history, at most `max` entries. `NotFound` when the release does not exist.
    async fn history(&self, release: &str, namespace: &str, max: usize) -> MdaiResult<Vec<Release>>;
    async fn list_releases(&self) -> Result<Vec<Release>>;
    async fn install(&self, spec: &ChartSpec) -> Result<Release>;
    async fn upgrade(&self, spec: &ChartSpec) -> Result<Release>;
    async fn uninstall(&self, release: &str, namespace: &str) -> MdaiResult<()>;
}

/// Split a chart label such as `opentelemetry-operator-0.43.1` into name and version.
pub fn split_chart_label(label: &str) -> (String, String) {
    for (i, _) in label.match_indices('-') {
        let rest = &label[i + 1..];
        let digits = rest.strip_prefix('v').unwrap_or(rest);
        if digits.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return (label[..i].to_string(), rest.to_string());
        }
    }
    (label.to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_labels_split_on_first_version_dash() {
        assert_eq!(split_chart_label("cert-manager-v1.15.0"), ("cert-manager".into(), "v1.15.0".into()));
        assert_eq!(split_chart_label("opentelemetry-operator-0.43.1"), ("opentelemetry-operator".into(), "0.43.1".into()));
        assert_eq!(split_chart_label("mdai-api-0.0.4-rc.1"), ("mdai-api".into(), "0.0.4-rc.1".into()));
        assert_eq!(split_chart_label("weird"), ("weird".into(), String::new()));
    }
}
