//! MDAI installer: sequences cluster provisioning, repository registration, chart
//! reconciliation and the operator manifest as one producer task on the progress bus.
//!
//! Steps run strictly in order; the first failure ends the run and nothing that
//! already succeeded is rolled back.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::FutureExt;
use mdai_apply::{ManifestOutcome, Patcher, RetryPolicy};
use mdai_core::{EngineRef, Emitter, KubeTarget, MdaiError, Progress, Registry};
use mdai_helm::{ensure_repos, ChartReconciler, HelmCli, PackageManager};
use mdai_kind::{ensure_cluster, ClusterProvider, KindCli};
use mdai_kubehub::{EngineApi, KubeEngineApi};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Tool and API clients bound to one cluster.
pub struct Connected {
    pub helm: Arc<dyn PackageManager>,
    pub engine: Arc<dyn EngineApi>,
}

/// Source of collaborators; swapped for in-memory ones in tests.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn cluster(&self) -> &dyn ClusterProvider;
    async fn connect(&self, target: &KubeTarget, engine: &EngineRef) -> Result<Connected>;
}

/// kind + helm binaries and a kube-rs client.
#[derive(Debug, Default)]
pub struct CliBackend {
    kind: KindCli,
}

#[async_trait::async_trait]
impl Backend for CliBackend {
    fn cluster(&self) -> &dyn ClusterProvider { &self.kind }

    async fn connect(&self, target: &KubeTarget, engine: &EngineRef) -> Result<Connected> {
        let helm = HelmCli::scoped(target.clone())?;
        let api = KubeEngineApi::connect(target, engine.clone()).await?;
        Ok(Connected { helm: Arc::new(helm), engine: Arc::new(api) })
    }
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub cluster_name: String,
    /// Skip provisioning and use `target` as-is.
    pub existing_cluster: bool,
    pub target: KubeTarget,
    pub apply_manifest: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self { cluster_name: "mdai-local".into(), existing_cluster: false, target: KubeTarget::default(), apply_manifest: true }
    }
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub cluster_name: String,
    pub uninstall: bool,
}

impl Default for DemoOptions {
    fn default() -> Self { Self { cluster_name: "mdai-local".into(), uninstall: false } }
}

pub struct Installer {
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
}

impl Installer {
    pub fn new(registry: Arc<Registry>, backend: Arc<dyn Backend>) -> Self {
        Self { registry, backend, policy: RetryPolicy::from_env() }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self { self.policy = policy; self }

    /// Provision (or reuse) the cluster. The kubeconfig file lives as long as the
    /// returned handle, so it is removed on every exit path of the caller.
    async fn provision(&self, name: &str, em: &Emitter) -> Result<(NamedTempFile, KubeTarget)> {
        let kc = ensure_cluster(self.backend.cluster(), name, self.registry.kind_template(), em).await?;
        let file = kc.persist().context("persisting kubeconfig")?;
        let target = KubeTarget { kubeconfig: Some(file.path().to_path_buf()), context: Some(kc.context()) };
        Ok((file, target))
    }

    async fn connect(&self, target: &KubeTarget) -> Result<Connected> {
        self.backend.connect(target, self.registry.engine()).await.context("connecting to cluster")
    }

    pub async fn install(&self, opts: &InstallOptions, em: &Emitter) -> Result<()> {
        let t0 = Instant::now();
        em.checkpoint()?;
        em.task("creating cluster").await;
        let (_kubeconfig, target) = if opts.existing_cluster {
            em.message("using existing cluster").await;
            (None, opts.target.clone())
        } else {
            let (file, target) = self.provision(&opts.cluster_name, em).await?;
            (Some(file), target)
        };
        let conn = self.connect(&target).await?;

        em.checkpoint()?;
        em.task("adding repos").await;
        ensure_repos(conn.helm.as_ref(), self.registry.repos(), em).await?;

        let reconciler = ChartReconciler::new(conn.helm.as_ref(), &self.registry);
        for key in self.registry.install_order() {
            em.checkpoint()?;
            em.task(format!("installing chart {}", key)).await;
            reconciler.reconcile(key, em).await?;
        }

        if opts.apply_manifest {
            em.checkpoint()?;
            em.task("applying operator manifest").await;
            let outcome = Patcher::new(conn.engine.as_ref())
                .with_policy(self.policy.clone())
                .apply_manifest(self.registry.engine_manifest())
                .await
                .context("applying operator manifest")?;
            if outcome == ManifestOutcome::Updated { em.debug("operator manifest existed; replaced").await; }
            em.message("operator manifest applied").await;
        }

        info!(took_ms = %t0.elapsed().as_millis(), "install finished");
        em.message("installation completed successfully").await;
        Ok(())
    }

    /// Charts in reverse install order, then CRDs. CRD failures only warn so a
    /// repeated uninstall stays safe.
    pub async fn uninstall(&self, target: &KubeTarget, em: &Emitter) -> Result<()> {
        em.checkpoint()?;
        let conn = self.connect(target).await?;
        let reconciler = ChartReconciler::new(conn.helm.as_ref(), &self.registry);
        for key in self.registry.install_order().iter().rev() {
            em.checkpoint()?;
            em.task(format!("uninstalling chart {}", key)).await;
            reconciler.uninstall(key, em).await?;
        }

        em.checkpoint()?;
        em.task("deleting CRDs").await;
        for crd in self.registry.crds() {
            em.checkpoint()?;
            match conn.engine.delete_crd(crd).await {
                Ok(()) => em.message(&format!("CRD {} deleted successfully.", crd)).await,
                Err(MdaiError::NotFound(_)) => em.message(&format!("CRD {} not found, skipping deletion.", crd)).await,
                Err(e) => {
                    warn!(crd = %crd, error = %e, "CRD deletion failed");
                    em.message(&format!("failed to delete CRD {}: {}", crd, e)).await;
                }
            }
        }
        em.message("uninstallation completed successfully").await;
        Ok(())
    }

    pub async fn demo(&self, opts: &DemoOptions, em: &Emitter) -> Result<()> {
        em.checkpoint()?;
        em.task("creating cluster").await;
        let (_kubeconfig, target) = self.provision(&opts.cluster_name, em).await?;
        let conn = self.connect(&target).await?;
        let reconciler = ChartReconciler::new(conn.helm.as_ref(), &self.registry);

        if opts.uninstall {
            for key in self.registry.demo_charts() {
                em.checkpoint()?;
                em.task(format!("uninstalling chart {}", key)).await;
                reconciler.uninstall(key, em).await?;
            }
            em.message("demo uninstallation completed successfully").await;
            return Ok(());
        }

        em.checkpoint()?;
        em.task("adding repos").await;
        ensure_repos(conn.helm.as_ref(), self.registry.repos(), em).await?;
        for key in self.registry.demo_charts() {
            em.checkpoint()?;
            em.task(format!("installing chart {}", key)).await;
            reconciler.reconcile(key, em).await?;
        }
        em.message("demo installation completed successfully").await;
        Ok(())
    }

    pub fn spawn_install(self: Arc<Self>, opts: InstallOptions, em: Emitter) -> JoinHandle<Result<()>> {
        em.spawn_run(move |em| async move { self.install(&opts, em).await }.boxed())
    }

    pub fn spawn_uninstall(self: Arc<Self>, target: KubeTarget, em: Emitter) -> JoinHandle<Result<()>> {
        em.spawn_run(move |em| async move { self.uninstall(&target, em).await }.boxed())
    }

    pub fn spawn_demo(self: Arc<Self>, opts: DemoOptions, em: Emitter) -> JoinHandle<Result<()>> {
        em.spawn_run(move |em| async move { self.demo(&opts, em).await }.boxed())
    }
}
