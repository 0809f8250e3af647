use clap::{Parser, Subcommand};
use logferry::agent::Agent;
use logferry::collector::run_collector;
use logferry::config::{AgentArgs, ServerArgs};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "logferry")]
#[command(about = "Container log shipping agent and collector")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in agent mode: tail container logs and forward them to a collector
    Agent(AgentArgs),
    /// Run in server mode: receive logs from agents and store them per container
    Server(ServerArgs),
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Token cancelled on the first Ctrl-C
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
        token.cancel();
    });
    cancel
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Agent(args) => {
            let config = args.resolve()?;
            info!(
                containers_dir = %config.containers_dir.display(),
                offsets_dir = %config.offsets_dir.display(),
                server = %config.server,
                "Starting agent"
            );
            let agent = Agent::new(config)?;
            agent.run(shutdown_token()).await
        }
        Commands::Server(args) => {
            let config = args.resolve()?;
            info!(
                log_path = %config.log_path.display(),
                listen = %config.listen,
                max_age_secs = config.max_age,
                "Starting server"
            );
            run_collector(config, shutdown_token()).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Agent(args) => args.verbose,
        Commands::Server(args) => args.verbose,
    };
    init_tracing(verbose);

    if let Err(e) = run(cli.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
