//! brain command-line entry point

use brain_core::kernel::{Kernel, KernelConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "brain")]
#[command(version = brain_core::version())]
#[command(about = "Brain compute kernel", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to a KernelConfig file (JSON, YAML, or TOML, by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved configuration and exit
    ShowConfig,
    /// Run the kernel until interrupted
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).await?;

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        config.log_level.parse().unwrap_or(Level::INFO)
    };
    let subscriber = tracing_subscriber::fmt().with_max_level(log_level);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match args.command {
        Some(Command::ShowConfig) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        Some(Command::Run) | None => run_kernel(config).await?,
    }

    Ok(())
}

async fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<KernelConfig> {
    let mut config = match path {
        Some(path) => {
            let contents = tokio::fs::read_to_string(path).await?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
                Some("toml") => toml::from_str(&contents)?,
                _ => serde_json::from_str(&contents)?,
            }
        }
        None => KernelConfig::default(),
    };

    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Overlay `BRAIN_*`-prefixed environment variables on top of the
/// file/default-derived config, the way `ConfigBuilder::from_env_with_defaults`
/// layers env vars over a base config elsewhere in the workspace.
fn apply_env_overrides(config: &mut KernelConfig) -> anyhow::Result<()> {
    use brain_tooling::config::{get_env_bool, get_env_or, get_env_parse_or};

    const PREFIX: &str = "BRAIN_";

    config.name = get_env_or(&format!("{PREFIX}NAME"), config.name.as_str())?;
    config.thread_pool_size = get_env_parse_or(&format!("{PREFIX}THREAD_POOL_SIZE"), config.thread_pool_size)?;
    config.process_pool_size = get_env_parse_or(&format!("{PREFIX}PROCESS_POOL_SIZE"), config.process_pool_size)?;
    config.cache_size_mb = get_env_parse_or(&format!("{PREFIX}CACHE_SIZE_MB"), config.cache_size_mb)?;
    config.cache_ttl_seconds = get_env_parse_or(&format!("{PREFIX}CACHE_TTL_SECONDS"), config.cache_ttl_seconds)?;
    config.retry_max_attempts = get_env_parse_or(&format!("{PREFIX}RETRY_MAX_ATTEMPTS"), config.retry_max_attempts)?;
    config.enable_metrics = get_env_bool(&format!("{PREFIX}ENABLE_METRICS"))?.unwrap_or(config.enable_metrics);
    config.enable_tracing = get_env_bool(&format!("{PREFIX}ENABLE_TRACING"))?.unwrap_or(config.enable_tracing);
    config.log_level = get_env_or(&format!("{PREFIX}LOG_LEVEL"), config.log_level.as_str())?;
    config.log_json = get_env_bool(&format!("{PREFIX}LOG_JSON"))?.unwrap_or(config.log_json);
    config.service_name = get_env_or(&format!("{PREFIX}SERVICE_NAME"), config.service_name.as_str())?;
    config.dlc_strict_dependency_check = get_env_bool(&format!("{PREFIX}DLC_STRICT_DEPENDENCY_CHECK"))?
        .unwrap_or(config.dlc_strict_dependency_check);
    config.leader_election_enabled =
        get_env_bool(&format!("{PREFIX}LEADER_ELECTION_ENABLED"))?.unwrap_or(config.leader_election_enabled);

    Ok(())
}

async fn run_kernel(config: KernelConfig) -> anyhow::Result<()> {
    let auto_load_dlcs = config.auto_load_dlcs;
    let leader_election_enabled = config.leader_election_enabled;
    let kernel = Arc::new(Kernel::new(config)?);

    kernel.load_cache_snapshot().await?;

    if auto_load_dlcs {
        match kernel.load_all_dlcs().await {
            Ok(failures) => {
                for (name, err) in failures {
                    warn!(dlc = %name, error = %err, "dlc failed to register");
                }
            }
            Err(e) => warn!(error = %e, "dlc auto-load pass failed"),
        }
        info!(bundles = kernel.registry().len(), "dlc auto-load complete");
    }

    if leader_election_enabled {
        warn!("leader_election_enabled is set but this build has no lock backend wired in; running without HA");
    }

    let _monitor = kernel.start_performance_monitor();
    let _config_watch = kernel.start_config_watch();

    info!("brain kernel running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    kernel.shutdown().await?;
    Ok(())
}
