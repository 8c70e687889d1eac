use std::io::IsTerminal;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, ArgGroup, Parser, Subcommand, ValueEnum};
use mdai_apply::{Module, Patcher};
use mdai_core::{channel, EventStream, KubeTarget, Registry, TelemetryFilter};
use mdai_helm::{ChartReconciler, HelmCli};
use mdai_installer::{CliBackend, DemoOptions, InstallOptions, Installer};
use mdai_kubehub::tiers::tier_json;
use mdai_kubehub::{get_kube_client, EngineApi, KubeConfigMaps, KubeEngineApi, StorageTier, TierStore};
use mdai_tui::{run_plain, run_tui, Outcome, ViewOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info};

mod editor;
mod table;

#[derive(Parser, Debug)]
#[command(name = "mdai", version, about = "MyDecisive cluster installer and configuration tool")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to the kubeconfig file
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true, env = "MDAI_KUBECONTEXT")]
    kubecontext: Option<String>,

    /// Show debug progress lines
    #[arg(long, global = true, action = ArgAction::SetTrue, conflicts_with = "quiet")]
    debug: bool,

    /// Only show the current step
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    quiet: bool,

    /// Directory with `<chart>-values.yaml` overrides
    #[arg(long = "values-dir", global = true, env = "MDAI_VALUES_DIR")]
    values_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum GetConfig { Mdai, Otel }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum UpdateConfig { Otel }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a local cluster and install the MDAI stack
    Install {
        #[arg(long = "cluster-name", default_value = "mdai-local")]
        cluster_name: String,
        /// Install into the cluster selected by --kubeconfig/--kubecontext
        #[arg(long = "existing-cluster", action = ArgAction::SetTrue)]
        existing_cluster: bool,
        /// Skip the confirmation prompt
        #[arg(long, action = ArgAction::SetTrue)]
        confirm: bool,
    },
    /// Remove the MDAI charts and CRDs
    Uninstall {
        /// Skip the confirmation prompt
        #[arg(long, action = ArgAction::SetTrue)]
        confirm: bool,
    },
    /// Install (or remove) the OpenTelemetry demo
    Demo {
        #[arg(long = "cluster-name", default_value = "mdai-local")]
        cluster_name: String,
        #[arg(long, action = ArgAction::SetTrue)]
        uninstall: bool,
    },
    /// Compare installed chart versions with the bundled ones
    Outdated,
    /// Enable a module
    Enable {
        #[arg(value_parser = parse_module)]
        module: Module,
    },
    /// Disable a module
    Disable {
        #[arg(value_parser = parse_module)]
        module: Module,
    },
    /// Mute pipelines with a named filter
    Mute {
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short = 'p', long = "pipeline", required = true, value_delimiter = ',')]
        pipelines: Vec<String>,
    },
    /// Disable (or delete) a muting filter
    Unmute {
        #[arg(short, long)]
        name: String,
        #[arg(long, action = ArgAction::SetTrue)]
        remove: bool,
    },
    /// Manage telemetry filters
    Filter {
        #[command(subcommand)]
        command: FilterCommand,
    },
    /// Print a configuration
    Get {
        #[arg(short, long, value_enum)]
        config: GetConfig,
    },
    /// Manage storage tiers
    #[command(name = "tiered_storage", visible_alias = "tiered-storage")]
    TieredStorage {
        #[command(subcommand)]
        command: TierCommand,
    },
    /// Update the collector configuration from a file or in $EDITOR
    Update {
        #[arg(short, long, value_enum, default_value_t = UpdateConfig::Otel)]
        config: UpdateConfig,
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long, value_enum, conflicts_with = "file")]
        phase: Option<editor::Phase>,
        #[arg(long, value_enum, conflicts_with = "file")]
        block: Option<editor::Block>,
    },
}

#[derive(Subcommand, Debug)]
enum FilterCommand {
    /// Add a pipeline or service filter
    #[command(group(ArgGroup::new("target").required(true).multiple(true).args(["pipelines", "service"])))]
    Add {
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short = 'p', long = "pipeline", value_delimiter = ',')]
        pipelines: Vec<String>,
        /// Service name pattern
        #[arg(short, long)]
        service: Option<String>,
        #[arg(short = 't', long = "telemetry-type", value_delimiter = ',', requires = "service")]
        telemetry_types: Vec<String>,
    },
    /// List filters
    List {
        /// Only service filters
        #[arg(long, action = ArgAction::SetTrue, conflicts_with = "pipeline")]
        service: bool,
        /// Only pipeline filters
        #[arg(long, action = ArgAction::SetTrue)]
        pipeline: bool,
    },
    Enable {
        #[arg(short, long)]
        name: String,
    },
    Disable {
        #[arg(short, long)]
        name: String,
    },
    Remove {
        #[arg(short, long)]
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum TierCommand {
    /// Add (or overwrite) a storage tier
    Add {
        /// Name the tier is stored under
        #[arg(short, long)]
        key: String,
        /// hot, cold or glacial
        #[arg(long)]
        tier: String,
        #[arg(long)]
        capacity: String,
        #[arg(long = "retention-period")]
        retention_period: String,
        #[arg(long)]
        format: String,
        #[arg(long)]
        location: String,
        #[arg(short = 'p', long = "pipeline", value_delimiter = ',', default_value = "logs", value_parser = ["logs", "metrics", "traces"])]
        pipelines: Vec<String>,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// List storage tiers
    List,
    /// Remove a storage tier
    Remove {
        #[arg(short, long)]
        key: String,
    },
}

fn parse_module(s: &str) -> Result<Module, String> { Module::from_str(s).map_err(|e| e.to_string()) }

fn init_tracing(default: &str) {
    let env = std::env::var("MDAI_LOG").unwrap_or_else(|_| default.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MDAI_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MDAI_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    fn target(&self) -> KubeTarget {
        KubeTarget { kubeconfig: self.kubeconfig.clone(), context: self.kubecontext.clone() }
    }

    fn registry(&self) -> Result<Registry> {
        let reg = Registry::builtin()?;
        match &self.values_dir {
            Some(dir) => reg.with_values_overlay(dir),
            None => Ok(reg),
        }
    }

    /// The TUI owns the terminal only for human output on a tty.
    fn interactive(&self) -> bool {
        self.output == Output::Human && std::io::stdout().is_terminal() && runs_progress(&self.command)
    }

    fn view_options(&self) -> ViewOptions {
        ViewOptions { debug: self.debug, quiet: self.quiet, json: self.output == Output::Json }
    }
}

fn runs_progress(cmd: &Commands) -> bool {
    matches!(cmd, Commands::Install { .. } | Commands::Uninstall { .. } | Commands::Demo { .. })
}

/// Drive the renderer until the run ends, then collect the producer's result.
async fn present(cli: &Cli, stream: EventStream, handle: JoinHandle<Result<()>>) -> Result<()> {
    let opts = cli.view_options();
    let outcome = if cli.interactive() {
        let (outcome, view) = run_tui(stream, opts).await?;
        if !cli.quiet {
            for line in view.lines() { println!("{}", line.text); }
        }
        outcome
    } else {
        run_plain(stream, opts).await?
    };
    if outcome == Outcome::Cancelled {
        eprintln!("stopping after the current step...");
    }
    let res = handle.await.context("progress task did not finish")?;
    match outcome {
        Outcome::Cancelled => Err(anyhow!("cancelled")),
        _ => res,
    }
}

async fn engine_api(cli: &Cli, registry: &Registry) -> Result<KubeEngineApi> {
    KubeEngineApi::connect(&cli.target(), registry.engine().clone()).await.context("connecting to cluster")
}

fn filter_added_message(f: &TelemetryFilter) -> String {
    match &f.filtered_services {
        Some(svc) => {
            let mut s = format!(r#"service pattern "{}" added successfully as filter "{}" ({})"#, svc.service_name_pattern, f.name, f.description);
            if let Some(p) = svc.pipelines.as_deref().filter(|p| !p.is_empty()) { s.push_str(&format!(" for pipelines {}", table::bracketed(p))); }
            if let Some(t) = svc.telemetry_types.as_deref().filter(|t| !t.is_empty()) { s.push_str(&format!(" for telemetry types {}", table::bracketed(t))); }
            s
        }
        None => format!(r#"pipeline(s) {} added successfully as filter "{}" ({})."#, table::bracketed(&f.pipelines()), f.name, f.description),
    }
}

fn yes_no(v: bool) -> String { if v { "✓".into() } else { "✗".into() } }

fn print_filters(filters: &[TelemetryFilter], only_service: bool, only_pipeline: bool) {
    let (service, pipeline): (Vec<&TelemetryFilter>, Vec<&TelemetryFilter>) = filters.iter().partition(|f| f.filtered_services.is_some());
    if !only_service {
        let rows: Vec<Vec<String>> = pipeline
            .iter()
            .map(|f| vec![f.name.clone(), f.description.clone(), yes_no(f.enabled), f.pipelines().join(", ")])
            .collect();
        println!("{}", table::render(&["NAME", "DESCRIPTION", "ENABLED", "MUTED PIPELINES"], &rows));
    }
    if !only_pipeline {
        let rows: Vec<Vec<String>> = service
            .iter()
            .filter_map(|f| f.filtered_services.as_ref().map(|svc| (f, svc)))
            .map(|(f, svc)| {
                vec![
                    f.name.clone(),
                    f.description.clone(),
                    yes_no(f.enabled),
                    svc.pipelines.clone().unwrap_or_default().join(", "),
                    svc.telemetry_types.clone().unwrap_or_default().join(", "),
                    svc.service_name_pattern.clone(),
                ]
            })
            .collect();
        if !only_service { println!(); }
        println!("{}", table::render(&["NAME", "DESCRIPTION", "ENABLED", "FILTERED PIPELINES", "FILTERED TELEMETRY", "SERVICE PATTERN"], &rows));
    }
}

fn target_summary(target: &KubeTarget) -> String {
    let kubeconfig = target.kubeconfig.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(default)".into());
    format!("kubeconfig: {}\nkubecontext: {}", kubeconfig, target.context.as_deref().unwrap_or("(current)"))
}

/// Ask before touching the cluster `target` points at, unless `--confirm` was given.
async fn confirm_target(skip: bool, question: &str, target: &KubeTarget, abort: &str) -> Result<()> {
    if skip { return Ok(()); }
    eprintln!("{}", target_summary(target));
    if confirm(question).await? { Ok(()) } else { Err(anyhow!("{}", abort)) }
}

fn print_tiers(tiers: &[(String, StorageTier)]) {
    if tiers.is_empty() {
        println!("No tiered storage found.");
        return;
    }
    let rows: Vec<Vec<String>> = tiers
        .iter()
        .map(|(k, t)| {
            vec![
                k.clone(),
                t.tier.clone(),
                "Enabled".into(),
                t.description.clone(),
                t.pipelines.join(", "),
                t.capacity.clone(),
                t.retention_period.clone(),
                t.format.clone(),
                t.location.clone(),
            ]
        })
        .collect();
    println!("{}", table::render(&["KEY", "TIER", "STATUS", "DESCRIPTION", "PIPELINES", "CAPACITY", "RETENTION PERIOD", "FORMAT", "LOCATION"], &rows));
}

fn tier_added_message(key: &str, t: &StorageTier) -> String {
    format!(
        "Key: {}\nTier: {}\nCapacity: {}\nRetention Period: {}\nFormat: {}\nDescription: {}\nPipelines: {}\nLocation: {}\ntiered storage added successfully, \"{}\"",
        key, t.tier, t.capacity, t.retention_period, t.format, t.description, table::bracketed(&t.pipelines), t.location, key
    )
}

async fn confirm(question: &str) -> Result<bool> {
    eprint!("{} [y/N] ", question);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await.context("reading answer")?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn run(cli: Cli) -> Result<()> {
    let registry = cli.registry()?;
    let target = cli.target();

    match &cli.command {
        Commands::Install { cluster_name, existing_cluster, confirm } => {
            confirm_target(*confirm, "Install MDAI into this cluster?", &target, "aborting installation").await?;
            info!(cluster = %cluster_name, existing = existing_cluster, "install invoked");
            let installer = Arc::new(Installer::new(Arc::new(registry), Arc::new(CliBackend::default())));
            let opts = InstallOptions { cluster_name: cluster_name.clone(), existing_cluster: *existing_cluster, target, ..Default::default() };
            let (em, stream) = channel();
            let handle = installer.spawn_install(opts, em);
            present(&cli, stream, handle).await?;
            if cli.output == Output::Human { println!("✓ installing MDAI cluster"); }
        }
        Commands::Uninstall { confirm } => {
            confirm_target(*confirm, "Uninstall MDAI from this cluster?", &target, "aborting uninstallation").await?;
            info!("uninstall invoked");
            let installer = Arc::new(Installer::new(Arc::new(registry), Arc::new(CliBackend::default())));
            let (em, stream) = channel();
            let handle = installer.spawn_uninstall(target, em);
            present(&cli, stream, handle).await?;
            if cli.output == Output::Human { println!("✓ uninstalling MDAI cluster"); }
        }
        Commands::Demo { cluster_name, uninstall } => {
            info!(cluster = %cluster_name, uninstall, "demo invoked");
            let installer = Arc::new(Installer::new(Arc::new(registry), Arc::new(CliBackend::default())));
            let (em, stream) = channel();
            let handle = installer.spawn_demo(DemoOptions { cluster_name: cluster_name.clone(), uninstall: *uninstall }, em);
            present(&cli, stream, handle).await?;
        }
        Commands::Outdated => {
            let helm = HelmCli::scoped(target.clone())?;
            let rows = ChartReconciler::new(&helm, &registry).outdated().await?;
            match cli.output {
                Output::Human => {
                    let cells: Vec<Vec<String>> = rows
                        .iter()
                        .map(|r| vec![r.freshness.symbol().to_string(), r.name.clone(), r.current.clone(), r.wanted.clone()])
                        .collect();
                    println!("{}", table::render(&["", "RELEASE", "CURRENT", "WANTED"], &cells));
                    println!("{}", target_summary(&target));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Enable { module } | Commands::Disable { module } => {
            let enabled = matches!(cli.command, Commands::Enable { .. });
            let api = engine_api(&cli, &registry).await?;
            Patcher::new(&api).set_module(*module, enabled).await?;
            println!("{} module {} successfully.", module.name(), if enabled { "enabled" } else { "disabled" });
        }
        Commands::Mute { name, description, pipelines } => {
            let api = engine_api(&cli, &registry).await?;
            let filter = TelemetryFilter::new(name.as_str()).description(description.as_str()).muting(pipelines.clone());
            Patcher::new(&api).mute(&filter).await?;
            println!("pipeline(s) {} muted successfully as filter {} ({}).", table::bracketed(pipelines), name, description);
        }
        Commands::Unmute { name, remove } => {
            let api = engine_api(&cli, &registry).await?;
            Patcher::new(&api).unmute(name, *remove).await?;
            println!("{} filter unmuted successfully.", name);
        }
        Commands::Filter { command } => {
            let api = engine_api(&cli, &registry).await?;
            let patcher = Patcher::new(&api);
            match command {
                FilterCommand::Add { name, description, pipelines, service, telemetry_types } => {
                    let filter = TelemetryFilter::new(name.as_str()).description(description.as_str());
                    let filter = match service {
                        Some(pattern) => filter.for_services(pattern.as_str(), pipelines.clone(), telemetry_types.clone()),
                        None => filter.muting(pipelines.clone()),
                    };
                    patcher.add_filter(&filter).await?;
                    println!("{}", filter_added_message(&filter));
                }
                FilterCommand::List { service, pipeline } => {
                    let filters = patcher.list_filters().await?;
                    match cli.output {
                        Output::Human => print_filters(&filters, *service, *pipeline),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&filters)?),
                    }
                }
                FilterCommand::Enable { name } => {
                    patcher.set_filter_enabled(name, true).await?;
                    println!(r#""{}" filter enabled successfully."#, name);
                }
                FilterCommand::Disable { name } => {
                    patcher.set_filter_enabled(name, false).await?;
                    println!(r#""{}" filter disabled successfully."#, name);
                }
                FilterCommand::Remove { name } => {
                    patcher.remove_filter(name).await?;
                    println!(r#""{}" filter removed successfully."#, name);
                }
            }
        }
        Commands::Get { config } => {
            let api = engine_api(&cli, &registry).await?;
            match (config, cli.output) {
                (GetConfig::Mdai, Output::Human) => print!("{}", serde_yaml::to_string(&api.get_engine().await?.raw)?),
                (GetConfig::Mdai, Output::Json) => println!("{}", serde_json::to_string_pretty(&api.get_engine().await?.raw)?),
                (GetConfig::Otel, Output::Human) => println!("{}", Patcher::new(&api).collector_config().await?),
                (GetConfig::Otel, Output::Json) => {
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "config": Patcher::new(&api).collector_config().await? }))?)
                }
            }
        }
        Commands::TieredStorage { command } => {
            let client = get_kube_client(&target).await.context("connecting to cluster")?;
            let maps = KubeConfigMaps::new(client, &registry.engine().namespace);
            let store = TierStore::new(&maps);
            match command {
                TierCommand::Add { key, tier, capacity, retention_period, format, location, pipelines, description } => {
                    let t = StorageTier {
                        tier: tier.clone(),
                        capacity: capacity.clone(),
                        retention_period: retention_period.clone(),
                        format: format.clone(),
                        description: description.clone(),
                        pipelines: pipelines.clone(),
                        location: location.clone(),
                    };
                    store.add(key, &t).await.context("failed to add storage tier")?;
                    println!("{}", tier_added_message(key, &t));
                }
                TierCommand::List => {
                    let tiers = store.list().await.context("failed to fetch tiered storages configmap")?;
                    match cli.output {
                        Output::Human => print_tiers(&tiers),
                        Output::Json => {
                            let items: Vec<serde_json::Value> = tiers.iter().map(|(k, t)| tier_json(k, t)).collect();
                            println!("{}", serde_json::to_string_pretty(&items)?);
                        }
                    }
                }
                TierCommand::Remove { key } => {
                    store.remove(key).await?;
                    println!(r#""{}" tiered storage removed successfully."#, key);
                }
            }
        }
        Commands::Update { config: UpdateConfig::Otel, file, phase, block } => {
            let api = engine_api(&cli, &registry).await?;
            let patcher = Patcher::new(&api);
            let next = match file {
                Some(path) => tokio::fs::read_to_string(path).await.with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let current = patcher.collector_config().await?;
                    let edited = editor::edit(&current, editor::jump_arg(*block, *phase)).await?;
                    if edited == current || !confirm("apply config?").await? {
                        println!("otel configuration not updated");
                        return Ok(());
                    }
                    edited
                }
            };
            patcher.update_collector_config(&next).await?;
            println!("otel configuration updated");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(if cli.interactive() { "warn" } else { "info" });
    init_metrics();
    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "command failed");
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
