//! In-memory cluster provider for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::{ClusterProvider, CreateOptions};

#[derive(Debug, Default)]
pub struct MockCluster {
    nodes: Mutex<HashMap<String, Vec<String>>>,
    creates: Mutex<Vec<String>>,
    fail_create: Option<String>,
}

impl MockCluster {
    pub fn with_nodes(self, name: &str, nodes: &[&str]) -> Self {
        if let Ok(mut m) = self.nodes.lock() {
            m.insert(name.to_string(), nodes.iter().map(|s| s.to_string()).collect());
        }
        self
    }

    pub fn failing_create(mut self, msg: &str) -> Self { self.fail_create = Some(msg.to_string()); self }

    pub fn create_calls(&self) -> Vec<String> { self.creates.lock().map(|c| c.clone()).unwrap_or_default() }
}

#[async_trait::async_trait]
impl ClusterProvider for MockCluster {
    async fn list_nodes(&self, name: &str) -> Result<Vec<String>> {
        let m = self.nodes.lock().map_err(|_| anyhow!("poisoned"))?;
        Ok(m.get(name).cloned().unwrap_or_default())
    }

    async fn create(&self, name: &str, _opts: &CreateOptions) -> Result<()> {
        self.creates.lock().map_err(|_| anyhow!("poisoned"))?.push(name.to_string());
        if let Some(msg) = &self.fail_create { return Err(anyhow!("{}", msg)); }
        self.nodes.lock().map_err(|_| anyhow!("poisoned"))?.insert(name.to_string(), vec![format!("{}-control-plane", name)]);
        Ok(())
    }

    async fn kubeconfig(&self, name: &str) -> Result<String> {
        Ok(format!("apiVersion: v1\nkind: Config\ncurrent-context: kind-{}\n", name))
    }
}
