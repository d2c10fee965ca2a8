// Magrig - rock-magnetometer rig operator console
use clap::Parser;
use magrig::cli::args::Args;
use magrig::cli::commands::execute_command;
use magrig::infrastructure::logging::init_logging;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    if let Err(e) = init_logging(level) {
        eprintln!("failed to initialize logging: {}", e);
    }

    if let Err(e) = execute_command(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
