pub mod application;
pub mod domain;
pub mod infrastructure;

use application::commands::{
    AppState, clear_sync_code_impl, confirm_phase_end_impl, get_timer_state_impl,
    history_summary_impl, list_history_impl, save_sync_code_impl, start_timer_impl,
    sync_history_impl, update_settings_impl,
};
use clap::{Parser, Subcommand};
use infrastructure::error::InfraError;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "pomosync")]
#[command(about = "Pomodoro timer with cross-device session history sync")]
#[command(version)]
struct Cli {
    /// Workspace holding config/, state/ and logs/. Defaults to the current directory.
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the countdown in the terminal, confirming each phase end automatically.
    Run {
        #[arg(long, default_value_t = 1)]
        cycles: u32,
    },
    /// List stored sessions, most recent first.
    History,
    /// Totals for a time window (default: the last 7 days).
    Summary {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    /// Change phase lengths in minutes.
    Settings {
        #[arg(long)]
        focus: Option<i64>,
        #[arg(long = "break")]
        break_minutes: Option<i64>,
    },
    /// Store the code that pairs this device with the sync service.
    SetCode { code: String },
    /// Forget the stored sync code.
    ClearCode,
    /// Exchange history with the sync service and merge the result.
    Sync {
        #[arg(long)]
        code: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), InfraError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_countdown(state: &AppState, cycles: u32) -> Result<(), InfraError> {
    let mut events = state.subscribe_timer();
    let mut display = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    start_timer_impl(state).await?;
    let mut completed = 0;
    while completed < cycles.max(1) {
        tokio::select! {
            _ = display.tick() => {
                let snapshot = get_timer_state_impl(state).await?;
                println!("{:<5} {}", snapshot.mode.as_str(), snapshot.display);
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(record) = event.committed.as_ref() {
                        completed += 1;
                        println!(
                            "session {} saved (focus {}s, break {}s)",
                            record.id, record.focus_seconds, record.break_seconds
                        );
                    }
                    if event.phase_ended && get_timer_state_impl(state).await?.phase_end_pending {
                        confirm_phase_end_impl(state).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("timer output skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => break,
        }
    }

    state.shutdown().await;
    Ok(())
}

async fn dispatch(state: &AppState, command: Command) -> Result<(), InfraError> {
    match command {
        Command::Run { cycles } => run_countdown(state, cycles).await,
        Command::History => print_json(&list_history_impl(state)?),
        Command::Summary { start, end } => print_json(&history_summary_impl(state, start, end)?),
        Command::Settings {
            focus,
            break_minutes,
        } => print_json(&update_settings_impl(state, focus, break_minutes).await?),
        Command::SetCode { code } => print_json(&save_sync_code_impl(state, code)?),
        Command::ClearCode => print_json(&clear_sync_code_impl(state)?),
        Command::Sync { code } => print_json(&sync_history_impl(state, code).await?),
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Run { .. } => "run",
        Command::History => "history",
        Command::Summary { .. } => "summary",
        Command::Settings { .. } => "settings",
        Command::SetCode { .. } => "set_code",
        Command::ClearCode => "clear_code",
        Command::Sync { .. } => "sync",
    }
}

pub fn run() -> ExitCode {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let workspace_root = match cli.root {
        Some(root) => root,
        None => match std::env::current_dir() {
            Ok(path) => path,
            Err(error) => {
                eprintln!("failed to resolve current directory: {error}");
                return ExitCode::FAILURE;
            }
        },
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start async runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    let state = match AppState::new(workspace_root) {
        Ok(state) => state,
        Err(error) => {
            eprintln!("failed to initialize app state: {error}");
            return ExitCode::FAILURE;
        }
    };

    let name = command_name(&cli.command);
    match runtime.block_on(dispatch(&state, cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", state.command_error(name, &error));
            ExitCode::FAILURE
        }
    }
}
