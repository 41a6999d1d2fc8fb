mod commands;

use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pgprefs")]
#[command(about = "Manage local PostgreSQL servers through launchd")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List saved and running servers
    List,

    /// Add and save a server
    Add {
        /// Server name (also the launchd label suffix)
        name: String,

        /// Account the server runs as (defaults to the current user)
        #[arg(long, short = 'u')]
        username: Option<String>,

        /// Directory containing the postgres binary
        #[arg(long)]
        bin: PathBuf,

        /// Data directory
        #[arg(long, short = 'D')]
        data: PathBuf,

        /// Log file (defaults to ~/Library/Logs/PostgreSQL/<name>.log)
        #[arg(long)]
        log: Option<PathBuf>,

        #[arg(long, short = 'p', default_value = "5432")]
        port: String,

        /// Manual, AtBoot or AtLogin
        #[arg(long, default_value = "Manual")]
        startup: String,
    },

    /// Check whether a server is running
    Status {
        /// Server name; all servers if omitted
        name: Option<String>,
    },

    /// Start a server
    Start { name: String },

    /// Stop a server
    Stop { name: String },

    /// Write the launchd descriptor without starting the server
    Create { name: String },

    /// Stop a server and remove its descriptor and saved settings
    Delete { name: String },

    /// Search for installed PostgreSQL binaries and running servers
    Search,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args = Args::parse();

    match args.command {
        Command::List => {
            commands::list().await?;
        }
        Command::Add { name, username, bin, data, log, port, startup } => {
            let options = commands::AddOptions {
                name,
                username,
                bin,
                data,
                log,
                port,
                startup: pgprefs::Startup::parse(&startup),
            };
            commands::add(options).await?;
        }
        Command::Status { name } => {
            commands::status(name.as_deref()).await?;
        }
        Command::Start { name } => {
            commands::start(&name).await?;
        }
        Command::Stop { name } => {
            commands::stop(&name).await?;
        }
        Command::Create { name } => {
            commands::create(&name).await?;
        }
        Command::Delete { name } => {
            commands::delete(&name).await?;
        }
        Command::Search => {
            commands::search().await?;
        }
    }

    Ok(())
}
