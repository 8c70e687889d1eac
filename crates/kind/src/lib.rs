//! MDAI kind: idempotently ensure a named local cluster exists.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use mdai_core::{env_or, MdaiError, MdaiResult, Progress};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

/// Options for cluster creation.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Raw kind `Cluster` config (node topology).
    pub config: String,
    /// How long to wait for the control plane to become ready.
    pub wait: Duration,
}

/// Cluster management collaborator.
#[async_trait::async_trait]
pub trait ClusterProvider: Send + Sync {
    async fn list_nodes(&self, name: &str) -> Result<Vec<String>>;
    async fn create(&self, name: &str, opts: &CreateOptions) -> Result<()>;
    async fn kubeconfig(&self, name: &str) -> Result<String>;
}

/// Generated access configuration, held in memory until a tool needs a file.
#[derive(Debug, Clone)]
pub struct Kubeconfig {
    pub cluster: String,
    pub raw: String,
}

impl Kubeconfig {
    /// Write to a temp file that is removed when the handle drops.
    pub fn persist(&self) -> MdaiResult<NamedTempFile> {
        let mut f = tempfile::Builder::new().prefix("mdai-kubeconfig-").suffix(".yaml").tempfile()?;
        f.write_all(self.raw.as_bytes())?;
        f.flush()?;
        debug!(cluster = %self.cluster, path = %f.path().display(), "kubeconfig persisted");
        Ok(f)
    }

    /// kind names its context `kind-<cluster>`.
    pub fn context(&self) -> String { format!("kind-{}", self.cluster) }
}

fn cluster_wait() -> Duration { Duration::from_secs(env_or("MDAI_CLUSTER_WAIT_SECS", 30u64)) }

/// List nodes for `name`; create the cluster from `template` when there are none.
/// Calling this again for an existing cluster performs no create.
pub async fn ensure_cluster(provider: &dyn ClusterProvider, name: &str, template: &str, progress: &dyn Progress) -> Result<Kubeconfig> {
    let t0 = Instant::now();
    progress.debug(&format!("listing nodes in cluster {}...", name)).await;
    let nodes = provider.list_nodes(name).await.with_context(|| format!("listing nodes in cluster {}", name))?;
    if nodes.is_empty() {
        progress.debug(&format!("cluster {} does not exist, creating...", name)).await;
        let opts = CreateOptions { config: template.to_string(), wait: cluster_wait() };
        provider.create(name, &opts).await.with_context(|| format!("creating cluster {}", name))?;
        info!(cluster = %name, took_ms = %t0.elapsed().as_millis(), "cluster created");
    } else {
        progress.debug(&format!("cluster {} already exists", name)).await;
        debug!(cluster = %name, nodes = nodes.len(), "cluster present");
    }
    let raw = provider.kubeconfig(name).await.with_context(|| format!("reading kubeconfig for cluster {}", name))?;
    progress.message(&format!("cluster {} is ready", name)).await;
    Ok(Kubeconfig { cluster: name.to_string(), raw })
}

/// `kind` binary driven through its CLI.
#[derive(Debug, Clone)]
pub struct KindCli {
    bin: PathBuf,
}

impl Default for KindCli {
    fn default() -> Self { Self::new(std::env::var("MDAI_KIND_BIN").unwrap_or_else(|_| "kind".to_string())) }
}

impl KindCli {
    pub fn new(bin: impl AsRef<Path>) -> Self { Self { bin: bin.as_ref().to_path_buf() } }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        debug!(bin = %self.bin.display(), args = ?args, "kind exec");
        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MdaiError::Setup(format!("spawning {}: {}", self.bin.display(), e)))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.context("writing kind stdin")?;
            drop(pipe);
        }
        let out = child.wait_with_output().await.context("waiting for kind")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("kind {} failed ({}): {}", args.join(" "), out.status, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl ClusterProvider for KindCli {
    async fn list_nodes(&self, name: &str) -> Result<Vec<String>> {
        let out = self.run(&["get", "nodes", "--name", name], None).await?;
        Ok(parse_node_list(&out))
    }

    async fn create(&self, name: &str, opts: &CreateOptions) -> Result<()> {
        let wait = format!("{}s", opts.wait.as_secs());
        self.run(&["create", "cluster", "--name", name, "--config", "-", "--wait", &wait], Some(&opts.config)).await?;
        Ok(())
    }

    async fn kubeconfig(&self, name: &str) -> Result<String> {
        self.run(&["get", "kubeconfig", "--name", name], None).await
    }
}

/// kind reports "No kind nodes found" on stderr and prints nothing on stdout when empty.
fn parse_node_list(out: &str) -> Vec<String> {
    out.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with("No kind nodes")).map(String::from).collect()
}
