use std::sync::{Arc, Mutex};

use anyhow::Result;
use mdai_apply::RetryPolicy;
use mdai_core::{channel, EngineRef, KubeTarget, MdaiError, ProgressEvent, Registry};
use mdai_helm::mock::MockHelm;
use mdai_installer::{Backend, Connected, DemoOptions, InstallOptions, Installer};
use mdai_kind::mock::MockCluster;
use mdai_kind::ClusterProvider;
use mdai_kubehub::mock::MockEngine;

struct MockBackend {
    cluster: MockCluster,
    helm: Arc<MockHelm>,
    engine: Arc<MockEngine>,
    targets: Mutex<Vec<KubeTarget>>,
}

impl MockBackend {
    fn new(helm: MockHelm, engine: MockEngine) -> Arc<Self> {
        Arc::new(Self { cluster: MockCluster::default(), helm: Arc::new(helm), engine: Arc::new(engine), targets: Mutex::new(Vec::new()) })
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    fn cluster(&self) -> &dyn ClusterProvider { &self.cluster }

    async fn connect(&self, target: &KubeTarget, _engine: &EngineRef) -> Result<Connected> {
        self.targets.lock().unwrap().push(target.clone());
        Ok(Connected { helm: self.helm.clone(), engine: self.engine.clone() })
    }
}

fn installer(backend: Arc<MockBackend>) -> Arc<Installer> {
    Arc::new(Installer::new(Arc::new(Registry::builtin().unwrap()), backend).with_retry_policy(RetryPolicy::immediate(3)))
}

/// Debug lines are only rendered on request; the contract covers the rest.
fn visible(evs: Vec<ProgressEvent>) -> Vec<ProgressEvent> {
    evs.into_iter().filter(|e| !matches!(e, ProgressEvent::Debug(_))).collect()
}

fn task(s: &str) -> ProgressEvent { ProgressEvent::Task(s.to_string()) }
fn msg(s: &str) -> ProgressEvent { ProgressEvent::Message(s.to_string()) }

#[tokio::test]
async fn full_install_emits_events_in_order() {
    let backend = MockBackend::new(MockHelm::default(), MockEngine::empty());
    let (em, stream) = channel();
    let handle = installer(backend.clone()).spawn_install(InstallOptions::default(), em);
    let evs = visible(stream.collect().await);
    handle.await.unwrap().unwrap();

    let mut want = vec![
        task("creating cluster"),
        msg("cluster mdai-local is ready"),
        task("adding repos"),
        msg("added repo mydecisive"),
        msg("added repo prometheus-community"),
        msg("added repo jetstack"),
        msg("added repo opentelemetry"),
    ];
    for (key, release, ns) in [
        ("cert-manager", "cert-manager", "cert-manager"),
        ("opentelemetry-operator", "opentelemetry-operator", "mdai"),
        ("prometheus", "prometheus", "mdai"),
        ("mdai-operator", "mydecisive-engine-operator", "mdai"),
        ("mdai-api", "mdai-api", "mdai"),
        ("mdai-console", "mdai-console", "mdai"),
        ("datalyzer", "datalyzer", "mdai"),
    ] {
        want.push(task(&format!("installing chart {}", key)));
        want.push(msg(&format!("chart {} in namespace {} installed successfully", release, ns)));
    }
    want.extend([
        task("applying operator manifest"),
        msg("operator manifest applied"),
        msg("installation completed successfully"),
        ProgressEvent::Done,
    ]);
    assert_eq!(evs, want);

    assert_eq!(backend.engine.creates(), 1);
    let targets = backend.targets.lock().unwrap().clone();
    assert_eq!(targets[0].context.as_deref(), Some("kind-mdai-local"));
    // kubeconfig temp file is gone once the run is over
    assert!(!targets[0].kubeconfig.as_ref().unwrap().exists());
}

#[tokio::test]
async fn failing_chart_stops_the_run_with_one_error() {
    let backend = MockBackend::new(MockHelm::default().failing_install("prometheus"), MockEngine::empty());
    let (em, stream) = channel();
    let handle = installer(backend.clone()).spawn_install(InstallOptions::default(), em);
    let evs = visible(stream.collect().await);
    let err = handle.await.unwrap().unwrap_err();

    let errors: Vec<&ProgressEvent> = evs.iter().filter(|e| matches!(e, ProgressEvent::Error(_))).collect();
    assert_eq!(errors.len(), 1, "evs={:?}", evs);
    assert!(!evs.contains(&ProgressEvent::Done));
    assert!(matches!(evs.last(), Some(ProgressEvent::Error(_))));
    let rendered = format!("{:#}", err);
    assert_eq!(evs.last(), Some(&ProgressEvent::Error(rendered.clone())));
    assert!(rendered.contains("failed to install chart prometheus in namespace mdai"), "rendered={}", rendered);

    let calls = backend.helm.calls();
    for later in ["mydecisive-engine-operator", "mdai-api", "mdai-console", "datalyzer"] {
        assert!(!calls.iter().any(|c| c.contains(later)), "{} was attempted: {:?}", later, calls);
    }
    assert_eq!(backend.engine.creates(), 0);
}

#[tokio::test]
async fn second_install_upgrades_and_skips_known_repos() {
    let backend = MockBackend::new(MockHelm::default(), MockEngine::empty());
    let inst = installer(backend.clone());
    for _ in 0..2 {
        let (em, stream) = channel();
        let h = inst.clone().spawn_install(InstallOptions::default(), em);
        let evs = stream.collect().await;
        h.await.unwrap().unwrap();
        assert_eq!(evs.last(), Some(&ProgressEvent::Done));
    }
    assert_eq!(backend.cluster.create_calls().len(), 1);
    let calls = backend.helm.calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("install ")).count(), 7);
    assert_eq!(calls.iter().filter(|c| c.starts_with("upgrade ")).count(), 7);
    assert_eq!(backend.helm.downloads().len(), 4);
    assert_eq!((backend.engine.creates(), backend.engine.replaces()), (1, 1));
}

#[tokio::test]
async fn existing_cluster_skips_provisioning() {
    let backend = MockBackend::new(MockHelm::default(), MockEngine::empty());
    let opts = InstallOptions { existing_cluster: true, target: KubeTarget { kubeconfig: None, context: Some("prod".into()) }, apply_manifest: false, ..Default::default() };
    let (em, stream) = channel();
    let h = installer(backend.clone()).spawn_install(opts, em);
    let evs = visible(stream.collect().await);
    h.await.unwrap().unwrap();
    assert_eq!(evs[1], msg("using existing cluster"));
    assert!(backend.cluster.create_calls().is_empty());
    assert_eq!(backend.targets.lock().unwrap()[0].context.as_deref(), Some("prod"));
    assert!(!evs.contains(&task("applying operator manifest")));
}

#[tokio::test]
async fn uninstall_downgrades_crd_failures_to_messages() {
    let helm = MockHelm::default().with_release(mdai_core::Release { name: "datalyzer".into(), namespace: "mdai".into(), chart_name: "datalyzer".into(), chart_version: "0.0.4".into(), ..Default::default() });
    let engine = MockEngine::empty().with_crds(&["mydecisiveengines.mydecisive.ai"]);
    let backend = MockBackend::new(helm, engine);
    let (em, stream) = channel();
    let h = installer(backend.clone()).spawn_uninstall(KubeTarget::default(), em);
    let evs = visible(stream.collect().await);
    h.await.unwrap().unwrap();

    assert_eq!(evs[0], task("uninstalling chart datalyzer"));
    assert_eq!(evs[1], msg("release datalyzer in namespace mdai uninstalled successfully"));
    assert!(evs.contains(&msg("chart cert-manager in namespace cert-manager not found. skipping uninstall.")));
    assert!(evs.contains(&msg("CRD mydecisiveengines.mydecisive.ai deleted successfully.")));
    assert!(evs.contains(&msg("CRD opampbridges.opentelemetry.io not found, skipping deletion.")));
    assert_eq!(backend.engine.deleted_crds().len(), 4);
    assert_eq!(&evs[evs.len() - 2..], &[msg("uninstallation completed successfully"), ProgressEvent::Done]);
    assert!(backend.helm.releases().is_empty());
}

#[tokio::test]
async fn demo_installs_only_the_demo_chart() {
    let backend = MockBackend::new(MockHelm::default(), MockEngine::empty());
    let (em, stream) = channel();
    let h = installer(backend.clone()).spawn_demo(DemoOptions::default(), em);
    let evs = visible(stream.collect().await);
    h.await.unwrap().unwrap();
    assert!(evs.contains(&msg("chart otel-demo in namespace mdai-otel-demo installed successfully")));
    assert_eq!(backend.helm.calls().iter().filter(|c| c.starts_with("install ")).count(), 1);
    assert_eq!(backend.engine.creates(), 0);
}

#[tokio::test]
async fn cancelling_the_consumer_stops_the_producer() {
    let backend = MockBackend::new(MockHelm::default(), MockEngine::empty());
    let (em, mut stream) = channel();
    let h = installer(backend.clone()).spawn_install(InstallOptions::default(), em);
    assert_eq!(stream.recv().await, Some(task("creating cluster")));
    stream.cancel();
    let rest = stream.collect().await;
    let err = h.await.unwrap().unwrap_err();
    assert!(matches!(err.downcast_ref::<MdaiError>(), Some(MdaiError::Cancelled)), "err={:#}", err);
    assert!(!rest.iter().any(|e| e.is_terminal()), "rest={:?}", rest);
    assert!(backend.helm.calls().is_empty());
}
