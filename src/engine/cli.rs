//! RecordHub CLI Module
//! Command-line interface for the recordhub server

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "recordhub-server")]
#[command(author = "RecordHub Team")]
#[command(version)]
#[command(about = "Uniform record access over JSON, REST and AirTable backends", long_about = None)]
pub struct Cli {
    /// Directory holding recordhub.config.json (defaults to current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a config with a single local JSON source
    Init {
        /// Project name
        #[arg(short, long)]
        name: String,
    },

    /// Start the API server
    Serve {
        /// Port to listen on (overrides the config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides the config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Connect every source and list the tables it serves
    Status,
}

impl Cli {
    pub fn get_config_dir(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
