mod global_opts;

use anyhow::{Context as _, bail};
use clap::Parser;
use colored::Colorize;
use drm_manager::{Config, Credentials, logging::setup_logging, ws_client::WsClient};
use global_opts::GlobalOpts;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Validate the configuration and credentials files
    Check(CheckCommand),
}

#[derive(Debug, clap::Args)]
struct CheckCommand {
    #[command(flatten)]
    global_opts: GlobalOpts,

    /// Do not contact the licensing server
    ///
    /// By default the credentials are verified by obtaining an OAuth2 token.
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    match opts.command {
        Commands::Check(check_command) => check(check_command).await?,
    }

    Ok(())
}

async fn check(command: CheckCommand) -> anyhow::Result<()> {
    let GlobalOpts { conf, cred } = command.global_opts;

    let config = Config::from_path(&conf)
        .with_context(|| format!("Failed to load configuration from {}", conf.display()))?;
    setup_logging(&config.settings)?;
    debug!(path = %conf.display(), "Configuration loaded");

    let policy = config.settings.retry_policy();
    let layout = config.drm.activators;

    println!("{}", "Licensing:".bold());
    if config.licensing.nodelocked {
        println!("  {} {}", "License type:".bold(), "Node-Locked".blue());
        if let Some(dir) = &config.licensing.license_dir {
            println!("  {} {}", "License directory:".bold(), dir.display());
        }
    } else {
        println!("  {} {}", "License type:".bold(), "Floating/Metering".blue());
    }
    if config.licensing.url.is_some() {
        println!("  {} {}", "OAuth2 endpoint:".bold(), config.oauth2_url()?);
        println!("  {} {}", "License endpoint:".bold(), config.metering_url()?);
    }
    println!(
        "  {} {} at {:#x} (range {:#x})",
        "Activators:".bold(),
        layout.count,
        layout.base_address,
        layout.address_range
    );
    println!(
        "  {} {} attempts, {:.1}s to {:.1}s backoff, {:.1}s request timeout",
        "Retry policy:".dimmed().bold(),
        policy.max_attempts,
        policy.period_short.as_secs_f64(),
        policy.period_long.as_secs_f64(),
        policy.request_timeout.as_secs_f64()
    );

    let credentials = Credentials::from_path(&cred)
        .with_context(|| format!("Failed to load credentials from {}", cred.display()))?;

    if command.offline || config.licensing.url.is_none() {
        info!("Skipping credentials verification against the licensing server");
        return Ok(());
    }

    let client = WsClient::new(&config, credentials)?;
    let token = match client.authenticate(&policy).await {
        Ok(token) => token,
        Err(err) => bail!("Credentials were rejected or the licensing server is unreachable: {err}"),
    };

    println!(
        "  {} {} (token valid for {}s)",
        "Credentials:".bold(),
        "valid".green(),
        token.validity_secs
    );
    Ok(())
}
