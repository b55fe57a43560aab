use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use clap::Parser;
use log::{error, info};
use pkica::config::Config;
use pkica::constants::{PKICA_DEFAULT_CONFIG_FILE, PKICA_SERVER_APP};
use pkica::server::{CaServer, Collaborators};


/// Certificate Authority server.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the config file
    #[arg(short, long, value_name = "FILE", default_value = PKICA_DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::create(&args.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("{err}");
            exit(1);
        }
    };

    let server = match CaServer::build(config, Collaborators::default()) {
        Ok(server) => server,
        Err(err) => {
            error!("{PKICA_SERVER_APP} failed to start: {err}");
            exit(1);
        }
    };
    server.start_sweeper(&tokio::runtime::Handle::current());

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {err}");
        exit(1);
    }
    info!("Shutting down {PKICA_SERVER_APP}");
    server.stop_sweeper();
}
