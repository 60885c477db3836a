//! exokube
//!
//! Brings a Kubernetes cluster up on Exoscale instances and tears it down
//! again, reconciling node by node against a local state file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use exokube_exec::SshConnector;
use exokube_provider::{CloudStackClient, ProviderConfig};

mod config;
mod driver;
mod state;

use config::Config;
use driver::Driver;
use state::StateStore;

#[derive(Parser)]
#[command(name = "exokube")]
#[command(about = "Kubernetes clusters on Exoscale", long_about = None)]
struct Cli {
    /// Path to exokube.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the state file location
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or resume the cluster until every node is ready
    Up,
    /// Destroy every node and the cluster security groups
    Down,
    /// Show the recorded state of every node
    Status,
    /// Print the admin kubeconfig of the control-plane
    Kubeconfig {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load_from(cli.config.as_deref())?;
    if let Some(state) = cli.state {
        config.state_file = Some(state);
    }
    config.log.init();

    let store = Arc::new(StateStore::open(&config.state_path(), &config.cluster.name)?);

    if let Commands::Status = cli.command {
        print_status(&store.snapshot().await);
        return Ok(());
    }

    let provider = CloudStackClient::new(ProviderConfig::resolve()?)?;
    let connector = SshConnector::new(config.reconciler.connect_retry);
    let driver = Driver::new(Arc::new(provider), Arc::new(connector), store, &config);

    match cli.command {
        Commands::Up => driver.up(&config.cluster).await?,
        Commands::Down => {
            let report = driver.down().await?;
            for error in &report.errors {
                eprintln!("warning: {error}");
            }
        }
        Commands::Kubeconfig { output } => {
            let kubeconfig = driver.kubeconfig().await?;
            match output {
                Some(path) => std::fs::write(&path, kubeconfig)?,
                None => print!("{kubeconfig}"),
            }
        }
        Commands::Status => {}
    }
    Ok(())
}

fn print_status(state: &state::ClusterState) {
    println!("cluster {}", state.cluster.name);
    println!("{:<24} {:<8} {:<10} {:<16} ERROR", "NODE", "ROLE", "PHASE", "ADDRESS");
    for node in state.nodes.values() {
        let role = node.role().map_or_else(|_| "?".to_string(), |r| r.label().to_string());
        let address = node.address().map(|a| a.to_string()).unwrap_or_default();
        println!(
            "{:<24} {:<8} {:<10} {:<16} {}",
            node.name,
            role,
            node.status.phase.to_string(),
            address,
            node.status.last_error.as_deref().unwrap_or("")
        );
    }
}
