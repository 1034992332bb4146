mod commands;
mod console;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hark_core::config::get_data_dir;

#[derive(Parser)]
#[command(name = "hark")]
#[command(about = "Inbox-watching voice assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize hark (first-time setup)
    Init {
        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },
    /// Run the assistant in the foreground, driven from the terminal
    Run {
        /// Write logs to hark.log in the data directory instead of stderr
        #[arg(long)]
        log_file: bool,
    },
    /// Show the running assistant's status
    Status,
    /// Stop the running assistant
    Stop,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Saved conversation state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Print the config file location
    Path,
}

#[derive(Subcommand, Debug)]
enum StateAction {
    /// Show the saved topic, reminders and recent turns
    Show,
    /// Clear the saved conversation state
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { log_file: true } => setup_file_logging()?,
        _ => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init(),
    }

    let data_dir = get_data_dir()?;

    match cli.command {
        Commands::Init { force } => commands::init::init_command(force),
        Commands::Run { .. } => commands::run::run_command().await,
        Commands::Status => commands::control::show_status(&data_dir).await,
        Commands::Stop => commands::control::stop_assistant(&data_dir).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config::handle_config_show(),
            ConfigAction::Path => commands::config::handle_config_path(),
        },
        Commands::State { action } => match action {
            StateAction::Show => commands::state::handle_state_show(),
            StateAction::Reset => commands::state::handle_state_reset(),
        },
    }
}

fn setup_file_logging() -> Result<()> {
    use std::fs::{create_dir_all, OpenOptions};

    let log_path = get_data_dir()?.join("hark.log");

    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Debug)
        .init();

    Ok(())
}
