//! meshchat - peer-to-peer encrypted chat
//!
//! A CLI for the mesh engine: identity generation and group chat over TCP.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{CommandExecutor, GroupCommand, IdCommand, KeygenCommand};
use meshchat::logging::{init, LogLevel};

/// meshchat - peer-to-peer encrypted chat
///
/// Peers find each other through bootstrap endpoints, authenticate with a
/// shared group secret and exchange messages and files directly.
#[derive(Parser)]
#[command(name = "meshchat")]
#[command(version)]
#[command(about = "Peer-to-peer encrypted group chat")]
#[command(long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity and profile
    Keygen(KeygenCommand),

    /// Show the identity stored in a profile
    Id(IdCommand),

    /// Join a group chat over TCP
    Group(GroupCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init(LogLevel::from_verbosity(cli.verbose));

    match cli.command {
        Commands::Keygen(cmd) => cmd.execute(),
        Commands::Id(cmd) => cmd.execute(),
        Commands::Group(cmd) => cmd.execute(),
    }
}
