//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter pipeline to gantry.yaml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a pipeline definition
    Validate {
        /// Path to pipeline file
        path: Option<String>,
    },

    /// Show the expanded job instances in execution order
    Plan {
        /// Path to pipeline file
        path: Option<String>,
    },

    /// Evaluate a push or manual event against the pipeline triggers
    Trigger {
        /// Path to pipeline file
        path: Option<String>,

        /// Branch the push landed on
        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Changed file paths, relative to the repository root
        #[arg(short, long = "changed", num_args = 1..)]
        changed: Vec<String>,

        /// Evaluate a manual dispatch instead of a push
        #[arg(long)]
        manual: bool,

        /// Execute the run if a trigger matched
        #[arg(long)]
        execute: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the pipeline locally as a manual dispatch
    Run {
        /// Path to pipeline file
        path: Option<String>,

        /// Branch recorded on the run
        #[arg(short, long)]
        branch: Option<String>,

        /// Maximum number of concurrently running job instances
        #[arg(short = 'j', long)]
        max_parallel: Option<usize>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the JSON schema of the pipeline format
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
