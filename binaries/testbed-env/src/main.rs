//! testbed-env - Provision an ephemeral test environment.
//!
//! Creates an isolated network, starts a Postgres sandbox, applies the schema,
//! starts the service under test and prints where both can be reached. The
//! environment is held until SIGINT/SIGTERM and then torn down.
//!
//! # Usage
//!
//! ```bash
//! # Provision with defaults, hold until Ctrl+C
//! testbed-env --schema db/schema.sql
//!
//! # Use a configuration file and another service build
//! testbed-env --config testbed.toml --service-image person-service:pr-42
//!
//! # Export the endpoints into a shell, then tear down immediately
//! eval "$(testbed-env --schema db/schema.sql --once)"
//! ```
//!
//! The endpoints are printed on stdout, either as `KEY=value` lines or as a
//! JSON object with `--json`. Logs go to stderr.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use config::TestbedConfig;
use testbed_orchestrator::{DockerRuntime, Endpoints, SandboxOrchestrator};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CLI arguments for testbed-env.
#[derive(Parser, Debug)]
#[command(
    name = "testbed-env",
    about = "Provision an ephemeral database + service test environment",
    version,
    author
)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Schema file applied to the database.
    #[arg(short, long, value_name = "FILE")]
    schema: Option<PathBuf>,

    /// Image of the service under test.
    #[arg(long, value_name = "IMAGE")]
    service_image: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long)]
    json_logs: bool,

    /// Print the endpoints as JSON.
    #[arg(long)]
    json: bool,

    /// Tear down as soon as the endpoints are printed.
    #[arg(long)]
    once: bool,

    /// Print the default configuration and exit.
    #[arg(long)]
    print_config: bool,
}

/// Initialize tracing/logging.
fn init_tracing(config: &config::LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs || config.format == "json" {
        "json"
    } else {
        &config.format
    };

    // stdout carries the endpoints
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let terminate = async {
        let mut stream = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        stream.recv().await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = signal::ctrl_c() => result.context("Failed to install Ctrl+C handler"),
        result = terminate => result,
    }
}

/// Renders the endpoints for stdout.
fn render_endpoints(endpoints: &Endpoints, json: bool) -> Result<String> {
    if json {
        return serde_json::to_string_pretty(endpoints).context("Failed to encode endpoints");
    }

    Ok(format!(
        "TESTBED_RUN_ID={}\nTESTBED_NETWORK={}\nSERVICE_URL={}\nDATABASE_URL={}\nSERVICE_DATABASE_ADDRESS={}",
        endpoints.run_id,
        endpoints.network,
        endpoints.service_url,
        endpoints.database_url,
        endpoints.service_database_address,
    ))
}

/// Publishes the endpoints and waits until the environment may go.
async fn hold(environment: &SandboxOrchestrator, args: &CliArgs) -> Result<()> {
    let endpoints = environment
        .endpoints()
        .context("Environment is not ready")?;
    println!("{}", render_endpoints(&endpoints, args.json)?);

    if args.once {
        return Ok(());
    }

    info!("Environment ready, press Ctrl+C to tear down");
    shutdown_signal().await?;
    info!("Shutdown signal received");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    if args.print_config {
        let config = TestbedConfig::default();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut config = if let Some(ref config_path) = args.config {
        TestbedConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        TestbedConfig::default()
    };

    config.merge_cli_args(&args);
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging, args.json_logs)?;

    info!(version = env!("CARGO_PKG_VERSION"), "testbed-env starting");

    let runtime = DockerRuntime::with_config(config.environment.runtime.clone())
        .await
        .context("Failed to connect to the container runtime")?;

    let mut environment = SandboxOrchestrator::new(Arc::new(runtime), config.environment);

    // A failed initialize has already cleaned up after itself
    if let Err(e) = environment.initialize().await {
        error!(error = %e, "Failed to provision test environment");
        return Err(e.into());
    }

    let held = hold(&environment, &args).await;

    let report = environment.cleanup().await;
    if !report.is_clean() {
        warn!(
            warnings = report.warnings.len(),
            "Teardown finished with warnings"
        );
    }

    held?;
    info!("testbed-env stopped");
    Ok(())
}
