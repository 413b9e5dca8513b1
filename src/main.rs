use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use marketpipe::config::{Paths, Settings};
use marketpipe::errors::LicenseError;
use marketpipe::hub::PushHub;
use marketpipe::license::{HttpRegistry, LicenseManager, machine_fingerprint};
use marketpipe::pipeline::PipelineManager;
use marketpipe::progress::MetricsStore;
use marketpipe::server::{AppState, serve};
use marketpipe::{plan, telemetry};

/// Host process exit codes.
const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_LICENSE_UNRECOVERABLE: i32 = 2;
const EXIT_CONFIG_INVALID: i32 = 3;

#[derive(Parser)]
#[command(name = "marketpipe")]
#[command(version, about = "Exchange report pipeline orchestrator")]
struct Cli {
    /// Path to marketpipe.toml (defaults to the executable's directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Base data directory override.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline host: control surface, push channel, stage plan.
    Serve {
        /// Port override for the control surface.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Activate a license key on this machine.
    Activate { key: String },
    /// Show the current license status.
    License,
    /// Print this machine's fingerprint.
    Fingerprint,
}

fn main() {
    // Optional .env beside the working directory; real env always wins.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    };
    if let Some(dir) = &cli.data_dir {
        settings.base_dir = Some(dir.clone());
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };

    let code = runtime.block_on(run(cli, settings));
    std::process::exit(code);
}

async fn run(cli: Cli, settings: Settings) -> i32 {
    let paths = match Paths::resolve(settings.base_dir.as_deref()) {
        Ok(paths) => Arc::new(paths),
        Err(e) => {
            eprintln!("cannot prepare data directories: {e:#}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    match cli.command {
        Commands::Fingerprint => {
            println!("{}", machine_fingerprint());
            0
        }
        Commands::Activate { ref key } => match license_manager(&settings, &paths) {
            Ok(license) => match license.activate(key).await {
                Ok(report) => {
                    println!(
                        "license activated, valid until {} ({} days remaining)",
                        report
                            .expires_on
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "unknown".into()),
                        report.days_remaining.unwrap_or_default()
                    );
                    0
                }
                Err(e) => {
                    eprintln!("activation failed: {e}");
                    if e.is_unrecoverable() {
                        EXIT_LICENSE_UNRECOVERABLE
                    } else {
                        EXIT_STARTUP_FAILURE
                    }
                }
            },
            Err(code) => code,
        },
        Commands::License => match license_manager(&settings, &paths) {
            Ok(license) => {
                let report = license.status().await;
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("failed to render status: {e}"),
                }
                0
            }
            Err(code) => code,
        },
        Commands::Serve { port } => {
            let _guard = match telemetry::init(&paths.logs, cli.verbose) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("failed to initialize logging: {e:#}");
                    return EXIT_STARTUP_FAILURE;
                }
            };

            let mut settings = settings;
            if let Some(port) = port {
                settings.port = port;
            }
            match serve_forever(settings, paths).await {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "host failed");
                    EXIT_STARTUP_FAILURE
                }
            }
        }
    }
}

fn license_manager(settings: &Settings, paths: &Arc<Paths>) -> Result<Arc<LicenseManager>, i32> {
    let registry = HttpRegistry::new(&settings.registry_url).map_err(|e| {
        eprintln!("invalid registry configuration: {e}");
        EXIT_CONFIG_INVALID
    })?;
    Ok(Arc::new(LicenseManager::new(
        paths.clone(),
        Arc::new(registry),
    )))
}

async fn serve_forever(settings: Settings, paths: Arc<Paths>) -> Result<()> {
    let settings = Arc::new(settings);

    let stage_registry =
        plan::build_registry(&settings).context("failed to build the stage plan")?;
    let hub = Arc::new(PushHub::default());
    let metrics = Arc::new(MetricsStore::new(paths.metrics.clone()));
    let license = license_manager(&settings, &paths)
        .map_err(|_| anyhow::anyhow!("license registry configuration invalid"))?;

    // Surface a hopeless license early so the operator sees it in logs,
    // but keep serving: activation happens through the API.
    match license.validate().await {
        Ok(liveness) => info!(
            days_remaining = liveness.days_remaining.unwrap_or_default(),
            "license valid"
        ),
        Err(LicenseError::NotActivated) => {
            info!("no license activated yet; pipeline start is gated until activation")
        }
        Err(e) => info!(code = e.code(), "license not currently valid: {e}"),
    }

    let manager = Arc::new(PipelineManager::new(
        stage_registry,
        hub.clone(),
        metrics,
        paths.clone(),
        settings.clone(),
    ));
    let _sweeper = manager.spawn_retention_sweeper();

    let state = Arc::new(AppState {
        manager,
        hub,
        license,
        paths,
        settings,
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    serve(state, cancel).await
}
