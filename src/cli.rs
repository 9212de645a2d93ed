//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// toolgate - OAuth-protected tools with streamed progress
#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOOLGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOOLGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOOLGATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TOOLGATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOOLGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default)
    Serve,

    /// Obtain an access token with the client-credentials grant and print it
    Token {
        /// Bypass the cached token
        #[arg(long)]
        force: bool,
    },

    /// Print a token's header and claims WITHOUT verifying its signature
    Inspect {
        /// The JWT to decode
        #[arg(required = true)]
        token: String,
    },
}
