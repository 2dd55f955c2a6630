//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Stream port both peers agree on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Service name to publish or subscribe to
    #[arg(short, long)]
    pub service: Option<String>,

    /// Print app events as JSON lines instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Advertise the service and chat with the first peer that greets us
    Publish {
        /// Let the in-process peer echo every line back
        #[arg(short, long)]
        echo: bool,
    },
    /// Discover the service, greet it and chat once the link is requested
    Subscribe {
        /// Let the in-process peer echo every line back
        #[arg(short, long)]
        echo: bool,
    },
    /// Run both roles unattended, exchange the given lines and exit
    Loopback {
        /// Lines the discoverer sends once streaming
        #[arg(default_values_t = vec!["hello".to_string()])]
        lines: Vec<String>,
        /// Let the advertiser answer every line
        #[arg(short, long)]
        echo: bool,
    },
    /// Print an example configuration file
    Config,
}
