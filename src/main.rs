use clap::{Parser, Subcommand};
use fabula_runtime::{HttpApiServer, RuntimeConfig};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "fabula", version = VERSION, about = "Fabula - interactive fiction runtime server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime API server
    Serve {
        /// Bind address (overrides BIND_ADDRESS)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the effective configuration and exit
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before reading configuration; missing files are fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = RuntimeConfig::from_env()?;
            if let Some(host) = host {
                config.bind_address = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let server = HttpApiServer::from_config(config)
                .map_err(|err| anyhow::anyhow!(err.to_string()))?;
            server
                .start()
                .await
                .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        }
        Commands::Config => {
            let config = RuntimeConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
