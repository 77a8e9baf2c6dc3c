#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use egress::{CONFIG_ENV, DEFAULT_CONFIG_PATHS, Egress, admin, locate_config};
use egress_common::logging;
use egress_proxy::Verification;
use egress_registry::AddressId;

#[derive(Parser)]
#[command(name = "egress", version, about = "Outbound mail queue worker")]
struct Cli {
    /// Configuration file (defaults to `EGRESS_CONFIG`, then ./egress.ron,
    /// then /etc/egress/egress.ron)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Claim and process queued messages until signalled (the default)
    Run,
    /// Verify the SOCKS5 proxy behind a proxy-pool address
    Verify {
        /// Registry id of the address
        address_id: AddressId,
    },
    /// List pools, their addresses and proxy verification status
    Pools,
    /// Apply database schema migrations
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let defaults = DEFAULT_CONFIG_PATHS.map(PathBuf::from);
    let config_path = locate_config(
        cli.config,
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &defaults,
    )?;
    let egress = Egress::load(&config_path)?;
    logging::init(&egress.logging);
    tracing::debug!(config = %config_path.display(), "Loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => egress.run().await,
        Command::Verify { address_id } => {
            let stores = egress.stores()?;
            match egress.verifier(&stores).verify(address_id).await? {
                Verification::Verified { at } => {
                    println!("Address {address_id} verified at {}", at.to_rfc3339());
                    Ok(())
                }
                Verification::Failed { reason } => {
                    anyhow::bail!("Address {address_id} failed verification: {reason}")
                }
            }
        }
        Command::Pools => {
            let stores = egress.stores()?;
            for listing in admin::list_pools(stores.registry.as_ref()).await? {
                println!("{listing}");
            }
            Ok(())
        }
        Command::Migrate => {
            let stores = egress.stores()?;
            if !stores.is_persistent() {
                anyhow::bail!("The configured store is in memory; there is nothing to migrate");
            }
            stores.migrate().await?;
            println!("Migrations applied");
            Ok(())
        }
    }
}
