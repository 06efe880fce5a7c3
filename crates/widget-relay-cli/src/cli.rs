//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Relay endpoint URL
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Local peer id (random UUID if omitted)
    #[arg(long, global = true)]
    pub peer: Option<String>,

    /// Channel to join (defaults to the peer id)
    #[arg(long, global = true)]
    pub channel: Option<String>,

    /// Page query string to read `channel-key` from
    #[arg(long, global = true)]
    pub page_query: Option<String>,

    /// Do not reconnect after the link closes
    #[arg(long, global = true)]
    pub no_reconnect: bool,

    /// Throttle window per state in milliseconds
    #[arg(long, global = true)]
    pub throttle_ms: Option<u64>,

    /// Full resync period in milliseconds
    #[arg(long, global = true)]
    pub full_sync_ms: Option<u64>,

    /// Use an in-process relay instead of the network
    #[arg(long, global = true)]
    pub local: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Join a channel: publish JSON lines from stdin, print peer changes
    Join {
        /// Name of the shared state
        #[arg(short, long, default_value = "state")]
        state: String,
        /// Initial local value (JSON)
        #[arg(short, long, default_value = "null")]
        default: String,
        /// Also print the local peer's own changes
        #[arg(long)]
        include_self: bool,
    },
    /// Run simulated peers that count upwards and print what they share
    Demo {
        /// Number of simulated peers
        #[arg(short, long, default_value_t = 3)]
        peers: usize,
        /// Updates per peer
        #[arg(short, long, default_value_t = 10)]
        rounds: u64,
        /// Delay between updates in milliseconds
        #[arg(short, long, default_value_t = 100)]
        interval_ms: u64,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Print the connection URL and exit
    Url,
}
