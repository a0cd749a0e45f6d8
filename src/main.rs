// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the roaster data logger
use clap::Parser;
use log::info;
use tokio::signal;

use roaster_logger::cli::{self, Cli};
use roaster_logger::session::StopHandle;

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    // Initialize logger with the level selected by the flags or the settings
    env_logger::Builder::from_default_env()
        .filter_level(args.log_level())
        .init();

    // Ctrl-C asks the running session to stop before its next sample
    let stop = StopHandle::new();
    let interrupt = stop.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, stopping session");
            interrupt.request_stop();
        }
    });

    let mut stdout = std::io::stdout();
    let code = match cli::run(args, stop, &mut stdout).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            cli::exit_code(&err)
        }
    };
    std::process::exit(code);
}
