use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use deployd_common::{utils::random_hex, PrepareParams};
use deployd_db::api::DbApi;
use deployd_engine::{stack::YamlStackLoader, DeployConfig, DeployService, ReconcilerLoop};
use deployd_kube::KubeClient;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_FILE: &str = "/etc/deployd.conf";
const DEFAULT_LOGS_FOLDER: &str = "/var/lib/deployd/logs";
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 5;
const DEFAULT_LEASE_TTL_SECS: u64 = 60;

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
struct DeploydConfig {
    db: Option<String>,
    worker_id: Option<String>,
    reconcile_interval_secs: Option<u64>,
    lease_ttl_secs: Option<u64>,
    repository_root: Option<PathBuf>,
    services_config_path: Option<PathBuf>,
    rollout_timeout_secs: Option<u64>,
    kaniko_timeout_secs: Option<u64>,
    field_manager: Option<String>,
    github_pat: Option<String>,
    kaniko_job_log_tail_lines: Option<i64>,
    wait_poll_interval_secs: Option<u64>,
    repo_sync_timeout_secs: Option<u64>,
    echo_probe_interval_secs: Option<u64>,
    echo_probe_timeout_secs: Option<u64>,
    tls_wait_interval_secs: Option<u64>,
    registry_url: Option<String>,
    registry_cleanup_keep_tags: Option<usize>,
}

impl DeploydConfig {
    fn deploy_config(&self) -> DeployConfig {
        let defaults = DeployConfig::default();
        let secs = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_secs).unwrap_or(fallback)
        };
        DeployConfig {
            repository_root: self
                .repository_root
                .clone()
                .unwrap_or(defaults.repository_root),
            services_config_path: self
                .services_config_path
                .clone()
                .unwrap_or(defaults.services_config_path),
            rollout_timeout: secs(self.rollout_timeout_secs, defaults.rollout_timeout),
            kaniko_timeout: secs(self.kaniko_timeout_secs, defaults.kaniko_timeout),
            field_manager: self
                .field_manager
                .clone()
                .unwrap_or(defaults.field_manager),
            github_pat: self
                .github_pat
                .clone()
                .or_else(|| std::env::var("CODEXK8S_GITHUB_PAT").ok())
                .unwrap_or_default(),
            kaniko_job_log_tail_lines: self
                .kaniko_job_log_tail_lines
                .unwrap_or(defaults.kaniko_job_log_tail_lines),
            wait_poll_interval: secs(self.wait_poll_interval_secs, defaults.wait_poll_interval),
            repo_sync_timeout: secs(self.repo_sync_timeout_secs, defaults.repo_sync_timeout),
            echo_probe_interval: secs(self.echo_probe_interval_secs, defaults.echo_probe_interval),
            echo_probe_timeout: secs(self.echo_probe_timeout_secs, defaults.echo_probe_timeout),
            tls_wait_interval: secs(self.tls_wait_interval_secs, defaults.tls_wait_interval),
            registry_url: self.registry_url.clone().unwrap_or_default(),
            registry_cleanup_keep_tags: self
                .registry_cleanup_keep_tags
                .unwrap_or(defaults.registry_cleanup_keep_tags),
        }
    }
}

#[derive(Parser)]
#[clap(name = "deployd")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// The config file path
    #[clap(short, long, action, value_hint = clap::ValueHint::AnyPath)]
    config_file: Option<PathBuf>,
    /// The folder for putting logs
    #[clap(short, long, action, value_hint = clap::ValueHint::AnyPath)]
    logs_folder: Option<PathBuf>,
    /// Don't run db migration on startup
    #[clap(short, long, action)]
    no_migration: bool,
    /// Write logs to stdout instead of the logs folder
    #[clap(long, action)]
    log_stdout: bool,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciler loop until interrupted
    Reconcile,
    /// Deploy one intent right away, bypassing the task queue
    Apply(IntentArgs),
    /// Queue one intent and wait until a reconciler finished it
    Prepare(IntentArgs),
    /// Cancel a queued or running deploy
    Cancel {
        #[clap(long)]
        run_id: String,
        #[clap(long, default_value = "")]
        reason: String,
    },
}

#[derive(Args)]
struct IntentArgs {
    #[clap(long)]
    run_id: String,
    #[clap(long, default_value = "")]
    runtime_mode: String,
    #[clap(long, default_value = "")]
    namespace: String,
    #[clap(long, default_value = "")]
    target_env: String,
    #[clap(long, default_value_t = 0)]
    slot_no: i32,
    #[clap(long, default_value = "")]
    repository: String,
    #[clap(long, default_value = "")]
    services_yaml: String,
    #[clap(long, default_value = "")]
    build_ref: String,
    #[clap(long, action)]
    deploy_only: bool,
}

impl From<IntentArgs> for PrepareParams {
    fn from(args: IntentArgs) -> Self {
        PrepareParams {
            run_id: args.run_id,
            runtime_mode: args.runtime_mode,
            namespace: args.namespace,
            target_env: args.target_env,
            slot_no: args.slot_no,
            repository_full_name: args.repository,
            services_yaml_path: args.services_yaml,
            build_ref: args.build_ref,
            deploy_only: args.deploy_only,
        }
    }
}

#[tokio::main]
pub async fn main() {
    let cli = Cli::parse();
    let _guard = match setup_log(&cli).await {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("can't setup logging: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli).await {
        tracing::error!("deployd error: {e:#}");
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = cli
        .config_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = read_config(&config_file).await?;
    let db_url = config
        .db
        .clone()
        .ok_or_else(|| anyhow!("can't find database url in your config file"))?;

    let db = DbApi::new(&db_url, cli.no_migration).await?;
    let kube = KubeClient::new()
        .await
        .context("can't connect to kubernetes cluster")?;
    let service = DeployService::new(
        config.deploy_config(),
        Arc::new(kube),
        Arc::new(db),
        Arc::new(YamlStackLoader),
    )?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    match cli.command.unwrap_or(Command::Reconcile) {
        Command::Reconcile => {
            let worker_id = config
                .worker_id
                .clone()
                .or_else(|| std::env::var("HOSTNAME").ok())
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("deployd-{}", random_hex(4)));
            let worker = ReconcilerLoop::new(
                &worker_id,
                Duration::from_secs(
                    config
                        .reconcile_interval_secs
                        .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS),
                ),
                Duration::from_secs(config.lease_ttl_secs.unwrap_or(DEFAULT_LEASE_TTL_SECS)),
            )?;
            worker.run(&service, shutdown).await;
        }
        Command::Apply(args) => {
            let result = service.apply_now(args.into()).await?;
            println!("deployed namespace {} env {}", result.namespace, result.target_env);
        }
        Command::Prepare(args) => {
            let result = service
                .prepare_run_environment(args.into(), &shutdown)
                .await?;
            println!("deployed namespace {} env {}", result.namespace, result.target_env);
        }
        Command::Cancel { run_id, reason } => {
            if service.cancel_run(&run_id, &reason).await? {
                println!("canceled {run_id}");
            } else {
                println!("{run_id} is unknown or already finished");
            }
        }
    }
    Ok(())
}

async fn read_config(path: &Path) -> Result<DeploydConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("can't read config file {}", path.to_string_lossy()))?;
    toml::from_str(&content).with_context(|| "wrong config file format")
}

async fn setup_log(cli: &Cli) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let var = std::env::var("RUST_LOG").unwrap_or_default();
    let var = format!(
        "error,deployd=info,deployd_engine=info,deployd_db=info,deployd_kube=info,deployd_common=info,{var}"
    );
    let filter = tracing_subscriber::EnvFilter::builder().parse_lossy(var);

    if cli.log_stdout {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    let folder = cli
        .logs_folder
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOGS_FOLDER));
    tokio::fs::create_dir_all(&folder).await?;
    let file_appender = tracing_appender::rolling::Builder::new()
        .max_log_files(30)
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("deployd.log")
        .build(folder)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .init();
    Ok(Some(guard))
}
