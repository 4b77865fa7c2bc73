//! `rig`: runs behavioral sessions and line maintenance on the rig.
//!
//! ```bash
//! # Validate a session file
//! rig check sessions/nose_poke.toml
//!
//! # Run it against a simulated rig and subject
//! rig run sessions/nose_poke.toml --simulate --records trials.json
//!
//! # Flush two taste lines for 10 s
//! rig clearout sessions/passive.toml --lines sucrose,nacl --duration 10
//! ```

mod app;
pub use app::App;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "rig")]
#[command(author, version, about = "Behavioral rig trial sequencer", long_about = None)]
pub struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Drive a simulated gateway instead of sysfs GPIO
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a session
    Run {
        config: PathBuf,

        /// Overrides the session file's seed
        #[arg(long)]
        seed: Option<u64>,

        /// Event log path; `.jsonl` selects JSON lines, anything else CSV
        #[arg(long)]
        events: Option<PathBuf>,

        /// Writes the trial records as JSON
        #[arg(long)]
        records: Option<PathBuf>,

        /// Seconds between pokes of the simulated subject
        #[arg(long, default_value = "3.0")]
        poke_every: f64,
    },

    /// Validate a session file and print the resolved setup
    Check { config: PathBuf },

    /// Open lines together to flush them
    Clearout {
        config: PathBuf,

        #[arg(long, value_delimiter = ',', required = true)]
        lines: Vec<String>,

        /// Seconds to hold the lines open
        #[arg(long, default_value = "10.0")]
        duration: f64,
    },

    /// Repeatedly open lines for a fixed time to measure delivered volume
    Calibrate {
        config: PathBuf,

        #[arg(long, value_delimiter = ',', required = true)]
        lines: Vec<String>,

        /// Seconds per opening
        #[arg(long, default_value = "0.015")]
        open_time: f64,

        #[arg(long, default_value = "100")]
        repeats: usize,
    },

    /// Pulse a marker line twice, `gap` seconds apart
    Mark {
        config: PathBuf,

        #[arg(long)]
        marker: String,

        #[arg(long, default_value = "0.1")]
        pulse: f64,

        #[arg(long, default_value = "600.0")]
        gap: f64,
    },

    /// Drive every declared output to its inactive level
    ClearAll { config: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("rig v{}", env!("CARGO_PKG_VERSION"));

    let app = App::new(cli)?;
    app.run()?;

    Ok(())
}
