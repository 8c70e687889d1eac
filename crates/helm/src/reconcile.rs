//! Install-or-upgrade per chart, uninstall, and the outdated report.

use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;

use anyhow::{Context, Result};
use mdai_core::{Freshness, MdaiError, OutdatedRow, Progress, Registry, Release};
use metrics::counter;
use tracing::{debug, info};

use crate::PackageManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartAction {
    Installed,
    Upgraded,
}

impl fmt::Display for ChartAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { ChartAction::Installed => "installed", ChartAction::Upgraded => "upgraded" })
    }
}

pub struct ChartReconciler<'a> {
    pm: &'a dyn PackageManager,
    registry: &'a Registry,
}

impl<'a> ChartReconciler<'a> {
    pub fn new(pm: &'a dyn PackageManager, registry: &'a Registry) -> Self { Self { pm, registry } }

    /// Existing release (any version) is upgraded; otherwise the chart is installed.
    pub async fn reconcile(&self, key: &str, progress: &dyn Progress) -> Result<ChartAction> {
        let spec = self.registry.chart(key)?;
        let t0 = Instant::now();
        let history = match self.pm.history(&spec.release_name, &spec.namespace, 1).await {
            Ok(h) => h,
            Err(MdaiError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("reading history of release {}", spec.release_name)),
        };
        let action = if history.is_empty() {
            self.pm.install(spec).await.with_context(|| format!("failed to install chart {} in namespace {}", spec.release_name, spec.namespace))?;
            counter!("chart_install", 1u64);
            ChartAction::Installed
        } else {
            debug!(release = %spec.release_name, from = %history[0].chart_version, to = %spec.version, "upgrading");
            self.pm.upgrade(spec).await.with_context(|| format!("failed to upgrade chart {} in namespace {}", spec.release_name, spec.namespace))?;
            counter!("chart_upgrade", 1u64);
            ChartAction::Upgraded
        };
        info!(release = %spec.release_name, ns = %spec.namespace, action = %action, took_ms = %t0.elapsed().as_millis(), "chart reconciled");
        progress.message(&format!("chart {} in namespace {} {} successfully", spec.release_name, spec.namespace, action)).await;
        Ok(action)
    }

    /// Returns false when there was nothing to remove.
    pub async fn uninstall(&self, key: &str, progress: &dyn Progress) -> Result<bool> {
        let spec = self.registry.chart(key)?;
        let present = match self.pm.history(&spec.release_name, &spec.namespace, 1).await {
            Ok(h) => !h.is_empty(),
            Err(MdaiError::NotFound(_)) => false,
            Err(e) => return Err(e).with_context(|| format!("reading history of release {}", spec.release_name)),
        };
        if !present {
            progress.message(&format!("chart {} in namespace {} not found. skipping uninstall.", spec.release_name, spec.namespace)).await;
            return Ok(false);
        }
        match self.pm.uninstall(&spec.release_name, &spec.namespace).await {
            Ok(()) => {}
            // raced with another uninstall
            Err(MdaiError::NotFound(_)) => {
                progress.message(&format!("chart {} in namespace {} not found. skipping uninstall.", spec.release_name, spec.namespace)).await;
                return Ok(false);
            }
            Err(e) => return Err(e).with_context(|| format!("failed to uninstall release {} in namespace {}", spec.release_name, spec.namespace)),
        }
        progress.message(&format!("release {} in namespace {} uninstalled successfully", spec.release_name, spec.namespace)).await;
        Ok(true)
    }

    /// One row per installed release whose chart is registered; a registered chart
    /// with no release gets a single outdated row with an empty current version.
    pub async fn outdated(&self) -> Result<Vec<OutdatedRow>> {
        let releases = self.pm.list_releases().await.context("listing releases")?;
        let mut rows = Vec::new();
        for (_, spec) in self.registry.charts() {
            let before = rows.len();
            rows.extend(releases.iter().filter(|r| r.chart_name == spec.chart_name()).map(|r| row_for(r, &spec.version)));
            if rows.len() == before {
                rows.push(OutdatedRow { freshness: Freshness::Outdated, name: spec.release_name.clone(), current: String::new(), wanted: spec.version.clone() });
            }
        }
        Ok(rows)
    }
}

fn row_for(release: &Release, wanted: &str) -> OutdatedRow {
    let freshness = if is_outdated(&release.chart_version, wanted) { Freshness::Outdated } else { Freshness::UpToDate };
    OutdatedRow { freshness, name: release.name.clone(), current: release.chart_version.clone(), wanted: wanted.to_string() }
}

fn parse_version(v: &str) -> Option<semver::Version> {
    let v = v.trim();
    semver::Version::parse(v.strip_prefix('v').unwrap_or(v)).ok()
}

/// `current < wanted` by semver, ignoring a leading `v`. Unparsable versions are
/// outdated unless the strings match.
pub fn is_outdated(current: &str, wanted: &str) -> bool {
    match (parse_version(current), parse_version(wanted)) {
        (Some(c), Some(w)) => c.cmp(&w) == Ordering::Less,
        _ => current.trim_start_matches('v') != wanted.trim_start_matches('v'),
    }
}
