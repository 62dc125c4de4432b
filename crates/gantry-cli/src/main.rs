//! Gantry CLI entrypoint.

use clap::Parser;
use console::style;
use std::path::Path;
use std::process::ExitCode;

mod commands;
mod config;
mod handlers;
mod logging;
mod pipeline;


use commands::{Commands, ConfigCommands, LogFormat, LogLevel};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Declarative CI pipeline orchestrator", long_about = None)]
struct Cli {
    /// Log level (overrides GANTRY_LOG)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    /// Log output format (overrides the configured format)
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = CliConfig::load()?;
    logging::init_logging(cli.log_level, cli.log_format.unwrap_or(config.log_format))?;

    match cli.command {
        Commands::Init { force } => handlers::init(Path::new("."), force),
        Commands::Validate { path } => handlers::validate(path.as_deref()),
        Commands::Plan { path } => handlers::plan(path.as_deref()),
        Commands::Trigger {
            path,
            branch,
            changed,
            manual,
            execute,
            json,
        } => {
            handlers::check_trigger_args(manual, &changed)?;
            handlers::trigger(
                &config,
                path.as_deref(),
                branch,
                changed,
                manual,
                execute,
                json,
            )
            .await
        }
        Commands::Run {
            path,
            branch,
            max_parallel,
            json,
        } => handlers::run(&config, path.as_deref(), branch, max_parallel, json).await,
        Commands::Schema => handlers::schema(),
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config),
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value),
        },
    }
}
