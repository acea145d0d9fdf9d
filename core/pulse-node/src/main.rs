//! pulse-node: command-line entry point for the node agent.
//!
//! ## Subcommands
//!
//! - `login`: Exchange email/password for tokens and record the identity
//! - `set-identity`: Record an identity directly, skipping login
//! - `start`: Connect and keep the node running until Ctrl-C
//! - `status`: Print the persisted snapshot as JSON
//! - `logout`: Remove the snapshot and stored account

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pulse_core::StorageConfig;
use pulse_node::{commands, logging};

#[derive(Parser)]
#[command(name = "pulse-node")]
#[command(about = "Keeps a node connection alive and tracks its points")]
#[command(version)]
struct Cli {
    /// State directory (defaults to $PULSE_HOME or ~/.pulse)
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with email and password (password read from stdin or PULSE_PASSWORD)
    Login {
        #[arg(long)]
        email: String,
    },

    /// Record the identity used for the connection
    SetIdentity {
        #[arg(value_name = "IDENTITY")]
        identity: String,
    },

    /// Clear the local snapshot and stored account
    Logout,

    /// Run the node until interrupted
    Start,

    /// Print the persisted snapshot
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let storage = match cli.home {
        Some(root) => StorageConfig::with_root(root),
        None => match StorageConfig::resolve() {
            Ok(storage) => storage,
            Err(err) => {
                let _logging_guard = logging::init(None);
                tracing::error!(error = %err, "Failed to resolve state directory");
                std::process::exit(1);
            }
        },
    };
    let logging_guard = logging::init(Some(&storage.logs_dir()));

    let result = match cli.command {
        Commands::Login { email } => commands::login(&storage, &email).await,
        Commands::SetIdentity { identity } => commands::set_identity(&storage, &identity),
        Commands::Logout => commands::logout(&storage),
        Commands::Start => commands::start(&storage).await,
        Commands::Status => commands::status(&storage).map(|rendered| println!("{rendered}")),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "pulse-node failed");
        drop(logging_guard);
        std::process::exit(1);
    }
}
