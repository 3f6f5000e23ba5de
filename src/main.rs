use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::watch;

use bigbrotr::config::ConfigFile;
use bigbrotr::db::{Pool, Store};
use bigbrotr::error::BigBrotrError;
use bigbrotr::services::{
    self, Finder, Monitor, RunOptions, Seeder, Service, Synchronizer, Validator,
};
use bigbrotr::{init_tracing, metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServiceKind {
    Seeder,
    Finder,
    Validator,
    Monitor,
    Synchronizer,
}

impl ServiceKind {
    fn default_config(&self) -> &'static str {
        match self {
            ServiceKind::Seeder => "config/seeder.yaml",
            ServiceKind::Finder => "config/finder.yaml",
            ServiceKind::Validator => "config/validator.yaml",
            ServiceKind::Monitor => "config/monitor.yaml",
            ServiceKind::Synchronizer => "config/synchronizer.yaml",
        }
    }
}

/// BigBrotr: archive and monitor the Nostr relay network.
#[derive(Debug, Parser)]
#[command(name = "bigbrotr", version, about)]
struct Cli {
    /// Pipeline service to run.
    #[arg(value_enum)]
    service: ServiceKind,

    /// Path to the service's YAML config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Exit code for fatal configuration errors.
const EXIT_CONFIG: u8 = 1;
/// Exit code when a service exceeded its consecutive failure budget.
const EXIT_MAX_FAILURES: u8 = 2;

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "bigbrotr::main", "shutdown_requested signal=interrupt");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run(cli: Cli) -> Result<(), BigBrotrError> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(cli.service.default_config()));

    macro_rules! launch {
        ($config_ty:ty, $build:expr) => {{
            let (file, database): (ConfigFile<$config_ty>, _) = ConfigFile::load(&config_path)?;
            file.service.validate()?;
            metrics::init(file.driver.metrics_enabled);

            let pool = Pool::new(database);
            pool.connect().await?;
            let store = Arc::new(Store::new(pool));

            let options = RunOptions {
                interval: file.driver.interval(),
                once: cli.once,
                max_consecutive_failures: file.driver.max_consecutive_failures,
            };
            #[allow(clippy::redundant_closure_call)]
            let mut service = ($build)(file.service, Arc::clone(&store));
            let result =
                services::run_service(&mut service as &mut dyn Service, &options, shutdown_signal())
                    .await;
            store.pool().close().await;
            result
        }};
    }

    match cli.service {
        ServiceKind::Seeder => {
            launch!(services::seeder::SeederConfig, |config, store| Seeder::new(config, store))
        }
        ServiceKind::Finder => {
            launch!(services::finder::FinderConfig, |config, store| Finder::new(config, store))
        }
        ServiceKind::Validator => {
            launch!(services::validator::ValidatorConfig, |config, store| {
                Validator::new(config, store)
            })
        }
        ServiceKind::Monitor => {
            launch!(services::monitor::MonitorConfig, |config, store| Monitor::new(config, store))
        }
        ServiceKind::Synchronizer => {
            launch!(services::synchronizer::SynchronizerConfig, |config, store| {
                Synchronizer::new(config, store)
            })
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(std::path::Path::new("logs"), &cli.log_level);

    tracing::info!(
        target: "bigbrotr::main",
        "starting service={:?} once={}",
        cli.service,
        cli.once
    );

    match run(cli).await {
        Ok(()) => {
            tracing::info!(target: "bigbrotr::main", "clean shutdown");
            ExitCode::SUCCESS
        }
        Err(BigBrotrError::Config(e)) => {
            tracing::error!(target: "bigbrotr::main", "fatal configuration error: {e}");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            tracing::error!(target: "bigbrotr::main", "service exited with error: {e}");
            ExitCode::from(EXIT_MAX_FAILURES)
        }
    }
}
