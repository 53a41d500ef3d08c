//! # sandbox-runner
//!
//! Runs one untrusted unit inside a freshly created sandbox.
//!
//! The runner creates a boundary rooted at the unit's directory, applies the
//! configured restriction policy plus any `--grant` overrides, runs the
//! unit's entry point and always destroys the boundary before exiting. The
//! unit's exit code becomes the process exit code.
//!
//! ## Running
//!
//! ```bash
//! # Deny-all policy from the default config
//! sandbox-runner units/hello.sbu --args "--verbose x"
//!
//! # Allow file access inside the unit's directory
//! sandbox-runner units/writer.sbu --grant file_io=granted
//!
//! # Show every restrictable capability
//! sandbox-runner --list-capabilities
//!
//! # With debug logging
//! RUST_LOG=debug sandbox-runner units/hello.sbu
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use sandbox_core::{
    BoundarySpec, CapabilityCatalog, ContextFactory, InvocationArguments, RestrictionPolicy,
    SandboxConfig,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Exit code used when the unit faults.
const FAULT_EXIT_CODE: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "sandbox-runner")]
#[command(about = "Run an untrusted unit inside a capability-restricted sandbox")]
#[command(version)]
struct Cli {
    /// Unit file to run
    #[arg(required_unless_present = "list_capabilities")]
    unit: Option<PathBuf>,

    /// Arguments for the unit's entry point, as one whitespace-separated string
    #[arg(short, long, default_value = "", allow_hyphen_values = true)]
    args: String,

    /// Configuration file (defaults to the user configuration)
    #[arg(short, long, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Grant a capability on top of the configured policy (repeatable)
    #[arg(short, long = "grant", value_name = "KIND=VALUE")]
    grants: Vec<String>,

    /// Run with every capability granted
    #[arg(long, conflicts_with = "grants")]
    unrestricted: bool,

    /// List restrictable capabilities and exit
    #[arg(long)]
    list_capabilities: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_capabilities {
        print_capabilities();
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.sandbox.log_level);
    info!("Starting sandbox-runner v{}", env!("CARGO_PKG_VERSION"));

    let unit = absolute_unit_path(cli.unit.context("No unit given")?)?;
    let policy = build_policy(&config, &cli.grants, cli.unrestricted)?;
    let args = split_arguments(&cli.args);
    debug!("Policy: {}; arguments: {:?}", policy.summary(), args.as_slice());

    let factory = ContextFactory::new(config);
    let handle = factory
        .create(BoundarySpec::for_unit(&unit).with_policy(policy))
        .with_context(|| format!("Failed to create sandbox for {}", unit.display()))?;

    let result = handle.load_and_run(unit.clone(), args).await;
    let report = handle.report().await;
    factory
        .destroy(handle)
        .await
        .context("Failed to destroy sandbox")?;

    match result {
        Ok(outcome) => {
            for line in &outcome.output {
                println!("{}", line);
            }
            info!("Unit exited with code {}", outcome.exit_code);
            std::process::exit(exit_status(outcome.exit_code));
        }
        Err(fault) => {
            let report = report.context("Failed to read sandbox state")?;
            for line in &report.output {
                println!("{}", line);
            }
            eprintln!("error: {}", fault);
            if let Some(diagnostic) = &report.diagnostic {
                eprintln!("{}", diagnostic);
            }
            std::process::exit(FAULT_EXIT_CODE);
        }
    }
}

/// Initialize logging on stderr. `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    match path {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => SandboxConfig::load_default().context("Failed to load default configuration"),
    }
}

fn absolute_unit_path(unit: PathBuf) -> Result<PathBuf> {
    if unit.is_absolute() {
        return Ok(unit);
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(unit))
}

/// Configured policy with command-line grants applied on top.
fn build_policy(
    config: &SandboxConfig,
    grants: &[String],
    unrestricted: bool,
) -> Result<RestrictionPolicy> {
    if unrestricted {
        return Ok(RestrictionPolicy::unrestricted());
    }
    let mut policy = config.policy.clone();
    for grant in grants {
        policy
            .grant_str(grant)
            .with_context(|| format!("Invalid --grant '{}'", grant))?;
    }
    Ok(policy)
}

/// Split the raw argument string on whitespace. No quoting.
fn split_arguments(raw: &str) -> InvocationArguments {
    raw.split_whitespace().collect()
}

fn exit_status(code: i64) -> i32 {
    code.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

fn print_capabilities() {
    let catalog = CapabilityCatalog::global();
    println!("{} restrictable capabilities:", catalog.len());
    for (kind, value_kind) in catalog.enumerate() {
        println!(
            "  {:<20} {:<22} {}",
            kind.as_str(),
            value_kind.as_str(),
            value_kind.accepted_names().join(" | ")
        );
    }
}
