use chainnet_alloc::config_loader::resolve_config;
use chainnet_alloc::{ChainId, LiveSnapshot, NetworkRegistry, NodeRole};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::info;
use serde::Serialize;
use std::path::PathBuf;

/// Port, address and subnet allocation for local sandbox chain networks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to an allocator configuration YAML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// State directory (overrides the configuration file)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Reconcile against a captured live-state JSON file instead of inspecting the host
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Allocate a port, address and RPC port for a new node
    AddNode {
        #[arg(long)]
        chain: ChainId,
        /// bootstrap, signer, member or rpc
        #[arg(long)]
        role: NodeRole,
        /// Account address of the node
        #[arg(long)]
        address: String,
    },
    /// Print a chain's network config
    Show {
        #[arg(long)]
        chain: ChainId,
    },
    /// Print every chain's network config
    List,
    /// Drop records of nodes that are no longer running and report their resources;
    /// the resources return to the pools on the next refresh
    Reconcile,
    /// Reconcile and return reclaimed resources to the pools
    Refresh,
    /// Print a chain's RPC port
    RpcPort {
        #[arg(long)]
        chain: ChainId,
    },
    /// Print the subnet of a chain's bucket
    Subnet {
        #[arg(long)]
        chain: ChainId,
    },
    /// Delete all persisted network state
    Reset,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = resolve_config(args.config.as_deref(), args.state_dir.clone())?;
    info!("State directory: {:?}", config.state_dir);

    let mut registry = NetworkRegistry::with_system(&config).wrap_err("Failed to set up registry")?;
    if let Some(path) = &args.snapshot {
        let snapshot = LiveSnapshot::load(path)
            .wrap_err_with(|| format!("Failed to load live-state snapshot '{}'", path.display()))?;
        info!("Using live-state snapshot from {:?}", path);
        registry = registry.with_snapshot(snapshot);
    }

    match args.command {
        Command::AddNode { chain, role, address } => {
            let allocation = registry
                .add_node(chain, role, &address)
                .wrap_err_with(|| format!("Failed to add {} node {} to chain {}", role, address, chain))?;
            print_json(&allocation)?;
        }
        Command::Show { chain } => {
            print_json(&registry.load_network_config(chain)?)?;
        }
        Command::List => {
            print_json(&registry.load_all_network_configs()?)?;
        }
        Command::Reconcile => {
            let report = registry
                .collect_and_cleanup_network_configs()
                .wrap_err("Reconciliation failed")?;
            print_json(&report)?;
        }
        Command::Refresh => {
            let report = registry
                .update_global_allocations()
                .wrap_err("Refreshing global allocations failed")?;
            print_json(&report)?;
        }
        Command::RpcPort { chain } => {
            let port = registry
                .rpc_port(chain)?
                .ok_or_else(|| eyre!("Chain {} has no RPC port yet", chain))?;
            println!("{}", port);
        }
        Command::Subnet { chain } => {
            let subnet = registry
                .addresses()
                .subnet_for(chain)?
                .ok_or_else(|| eyre!("Chain {} is not bound to an address bucket yet", chain))?;
            println!("{}", subnet);
        }
        Command::Reset => {
            registry.reset()?;
            info!("Network state reset");
        }
    }

    Ok(())
}
