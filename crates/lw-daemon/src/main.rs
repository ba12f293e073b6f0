//! lw-daemon - Supervise a worker loop and stream it to WebSocket observers

use clap::Parser;
use lw_daemon::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        loopwatch_core::logging::init_with_level(tracing::Level::DEBUG);
    } else {
        loopwatch_core::logging::init();
    }

    if let Err(e) = cli.execute().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
