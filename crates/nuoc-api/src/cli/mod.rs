//! CLI command definitions for the `nuoc` binary.

pub mod awakeable;
pub mod job;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Durable-execution workflow engine.
#[derive(Parser)]
#[command(name = "nuoc", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine configuration file (TOML). Defaults to `<data_dir>/nuoc.toml`.
    #[arg(long, short, global = true, env = "NUOC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine driver and the HTTP API until interrupted.
    Serve {
        /// Listen address, overriding `http.bind`.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Resolve a pending awakeable.
    Resolve {
        id: String,
        /// Payload as JSON; `{}` when omitted.
        payload: Option<String>,
    },

    /// Reject a pending awakeable.
    Reject {
        id: String,
        #[arg(long, default_value = "rejected")]
        reason: String,
    },

    /// Submit a job definition file (YAML or JSON).
    Submit {
        file: PathBuf,
        /// Run the job in this process until it settles or suspends.
        #[arg(long)]
        wait: bool,
    },

    /// Show a job and its tasks.
    Status { job_id: String },

    /// Cancel a job.
    Cancel { job_id: String },
}
