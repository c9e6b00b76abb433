use clap::Parser;
use std::path::PathBuf;

use messageu::config::ServerAddress;
use messageu::engine::ClientEngine;
use messageu::menu::Menu;
use messageu::{CLIENT_INFO, SERVER_INFO};

#[derive(Parser)]
#[command(name = "messageu")]
#[command(about = "End-to-end encrypted relay messaging client", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the relay address file
    #[arg(long, default_value = SERVER_INFO)]
    server_info: PathBuf,

    /// Path to the identity file
    #[arg(long, default_value = CLIENT_INFO)]
    client_info: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let server = match ServerAddress::load(&cli.server_info) {
        Ok(server) => server,
        Err(e) => client_stop(e),
    };
    log::debug!("relay address: {server}");

    let mut engine = ClientEngine::new(server, cli.client_info);
    let registered = match engine.load_identity() {
        Ok(registered) => registered,
        Err(e) => client_stop(e),
    };

    Menu::new(engine, registered).run();
}

fn client_stop(error: messageu::error::ClientError) -> ! {
    eprintln!("Fatal Error: {error}");
    eprintln!("Client will stop.");
    std::process::exit(1);
}
