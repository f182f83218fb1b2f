use clap::{Parser, Subcommand};

pub mod config;
pub mod run;
pub mod version;

#[derive(Parser)]
#[command(name = "dhtfox")]
#[command(author = "DHTFox Project")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "DHT bridge for caching web proxies", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the DHT node and an interactive get/put shell
    Run {
        /// Path to config file (default: ~/.local/share/dhtfox/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Do not announce cached URLs after the node starts
        #[arg(long)]
        no_announce: bool,
    },

    /// Write a default config file and built-in component manifest
    InitConfig {
        /// Where to write the config (default: ~/.local/share/dhtfox/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run {
            config,
            no_announce,
        } => run::execute(config, no_announce).await,
        Commands::InitConfig { config, force } => config::init(config, force),
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}
