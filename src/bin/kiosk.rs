//! Operator console for the kiosk engine. Reads one command per line from
//! stdin, feeds it through the engine and prints the resulting view.
//!
//! ```text
//! kiosk [config.toml]
//! RUST_LOG=kiosk_core=debug kiosk
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kiosk_core::config::KioskConfig;
use kiosk_core::shell::{parse_command, Command, Shell};
use kiosk_core::Event;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiosk_core=info,kiosk=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => match KioskConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => KioskConfig::default(),
    };

    let storage = match config.storage.open() {
        Ok(storage) => storage,
        Err(e) => {
            error!(error = %e, "failed to open offline queue storage");
            return ExitCode::FAILURE;
        }
    };

    let mut shell = Shell::new(config, storage);
    shell.dispatch(Event::Boot { online: true });
    print_view(&shell);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "stdin read failed");
                        return ExitCode::FAILURE;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Command::Dispatch(events)) => {
                        for event in events {
                            shell.dispatch(event);
                        }
                        print_view(&shell);
                    }
                    Ok(Command::Status) => {
                        info!(view = ?shell.view(), "status");
                        print_view(&shell);
                    }
                    Ok(Command::Quit) => break,
                    Err(e) => warn!(input = %line.trim(), "{e}"),
                }
            }
            Some(input) = shell.next_input() => {
                shell.handle(input);
                print_view(&shell);
            }
        }
    }

    info!(pending = shell.view().pending_count, "kiosk shutting down");
    ExitCode::SUCCESS
}

fn print_view(shell: &Shell) {
    match serde_json::to_string(&shell.view()) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "view serialization failed"),
    }
}
