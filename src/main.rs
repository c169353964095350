use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use stackfs::{branch, config, error, union, xino};

fn main() {
    match run() {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> error::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("STACKFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Check { config, json } => {
            commands::run_check(config, json)?;
            Ok(0)
        }
        Commands::Xino { action } => {
            commands::handle_xino_command(action)?;
            Ok(0)
        }
        Commands::Config { action } => {
            commands::handle_config_command(action)?;
            Ok(0)
        }
    }
}
