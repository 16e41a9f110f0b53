use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "handshake-mesh")]
#[command(version, about = "Peer mesh node with an authenticated ephemeral key handshake", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node (default mode)
    Run,

    /// Print the effective configuration
    Info,
}
