mod attestation;
mod batch;
mod config;
mod error;
mod job;
mod manifest;
mod orchestrator;
mod package;
mod sandbox;
mod sanitize;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::attestation::{TeeOracle, UnixSocketOracle};
use crate::batch::BatchOptions;
use crate::config::Config;
use crate::orchestrator::Verifier;
use crate::package::Package;
use crate::sandbox::DockerRuntime;

/// Configuration file used when `-c` is not given, if present.
const DEFAULT_CONFIG_PATH: &str = "config/verifier.toml";

fn print_help() {
    println!(
        "\
skill-verifier v{}

Verifies untrusted skill packages in a network-less sandbox and prints
an attested result for each.

USAGE:
    skill-verifier [OPTIONS] PACKAGE...

ARGUMENTS:
    PACKAGE    Skill directory or .tar / .tar.gz archive containing SKILL.md

OPTIONS:
    -c, --config <PATH>    Path to TOML configuration file
                           [default: config/verifier.toml, if it exists]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, skill_verifier=debug,warn)

EXIT STATUS:
    0    every package completed and its test command passed
    1    at least one package failed, was rejected or did not pass,
         or verification was interrupted

EXAMPLES:
    skill-verifier ./weather                      # verify a directory
    skill-verifier -c /etc/verifier.toml a.tgz    # custom config path
    RUST_LOG=debug skill-verifier ./weather       # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Args {
    config_path: Option<String>,
    packages: Vec<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut config_path = None;
    let mut packages = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("skill-verifier v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("{arg} requires a path"))?;
                config_path = Some(path);
            }
            other if other.starts_with('-') => {
                return Err(anyhow!("Unknown option: {other} (see --help)"));
            }
            _ => packages.push(PathBuf::from(arg)),
        }
    }

    if packages.is_empty() {
        return Err(anyhow!("No package given (see --help)"));
    }
    Ok(Args {
        config_path,
        packages,
    })
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).is_file() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)
        }
        None => {
            info!("No configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("skill_verifier=info")),
        )
        .init();

    let config = load_config(args.config_path.as_deref())?;

    info!("Sandbox runtime: {}", config.sandbox.runtime_binary);
    info!(
        "Base environments: {}",
        config
            .sandbox
            .environments
            .iter()
            .map(|(id, image)| format!("{id}={image}"))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let runtime = Arc::new(DockerRuntime::new(config.sandbox.runtime_binary.clone()));
    let oracle: Option<Arc<dyn TeeOracle>> = if config.attestation.enabled {
        Some(Arc::new(UnixSocketOracle::new(
            config.attestation.socket_path.clone(),
            Duration::from_secs(config.attestation.timeout_secs),
        )))
    } else {
        None
    };

    let verifier = Verifier::new(&config, runtime, oracle)?;
    let sweeper = verifier.spawn_sweeper();

    // Unreadable paths are reported per package, like any other rejection
    let mut packages = Vec::new();
    let mut all_passed = true;
    for path in &args.packages {
        match Package::from_path(path) {
            Ok(package) => packages.push(package),
            Err(e) => {
                warn!("Skipping {}: {e}", path.display());
                all_passed = false;
            }
        }
    }

    let options = BatchOptions::for_limits(&config.limits);
    let reports = tokio::select! {
        reports = batch::verify_all(&verifier, packages, &options) => reports,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, cleaning up");
            sweeper.abort();
            verifier.shutdown().await;
            return Err(anyhow!("interrupted before all packages were verified"));
        }
    };
    sweeper.abort();

    for report in &reports {
        println!("{}", serde_json::to_string_pretty(report)?);
        if let Some(attestation) = &report.attestation {
            if !attestation.is_hardware_backed() {
                warn!("{}: attestation is not hardware-backed", report.package);
            }
        }
        all_passed &= report.passed();
    }

    let passed = reports.iter().filter(|r| r.passed()).count();
    info!("{passed}/{} package(s) passed", args.packages.len());

    if !all_passed {
        std::process::exit(1);
    }
    Ok(())
}
