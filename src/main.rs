//! toolgate - OAuth-protected tool server with streamed progress

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use toolgate::{
    auth::{TokenAcquirer, TokenVerifier},
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Token { force }) => run_token(cli.config.as_deref(), force).await,
        Some(Command::Inspect { ref token }) => run_inspect(token),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Acquire a client-credentials token and print it
async fn run_token(config_path: Option<&Path>, force: bool) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let acquirer = match TokenAcquirer::from_config(&config.oauth) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match acquirer.get_token(force).await {
        Ok(token) => {
            println!("{token}");
            let info = acquirer.token_info();
            if let Some(secs) = info.seconds_until_expiry {
                eprintln!("Expires in {secs} seconds");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Token acquisition failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Decode a token without verification
fn run_inspect(token: &str) -> ExitCode {
    match TokenVerifier::token_info(token) {
        Ok(info) => {
            eprintln!("⚠️  Signature NOT verified");
            println!(
                "{}",
                serde_json::to_string_pretty(&info).unwrap_or_default()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        auth = config.auth.enabled,
        streaming = config.streaming.enabled,
        "Starting toolgate"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
