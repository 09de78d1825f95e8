//! DLT Log CLI Application
//!
//! Command-line front end for the dlt-log-engine library:
//! - `index`: build absolute and filtered indices for log files
//! - `scan`: frame a raw capture and report framing statistics
//! - `receive`: connect to the configured ECUs and log live traffic

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod config;
mod index;
mod receive;
mod scan;

/// DLT Log Reader - Index, scan and receive DLT logs
#[derive(Parser, Debug)]
#[command(name = "dlt-log-cli")]
#[command(about = "Index, scan and receive DLT log files", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index one or more log files and print a summary per file
    Index {
        /// DLT log files (indexed in parallel)
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Path to configuration file (filters, default filters, engine settings)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Order the filtered index by storage time
        #[arg(long)]
        sort_by_time: bool,

        /// Ignore the configured filters
        #[arg(long)]
        no_filters: bool,

        /// Directory for persisted indices
        #[arg(long, value_name = "DIR")]
        cache_dir: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Frame a capture and print statistics
    Scan {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Record boundaries in the capture
        #[arg(short, long, value_enum, default_value_t = ScanMode::Storage)]
        mode: ScanMode,

        /// Print the statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect to the configured ECUs and append their traffic to the log file
    Receive {
        /// Path to configuration file ([[ecus]] and engine settings)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Live log file (overrides engine.connection.log_file)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Stop after this many seconds (default: run until killed)
        #[arg(short, long, value_name = "SECONDS")]
        duration: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScanMode {
    /// File records with storage headers
    Storage,
    /// "DLS" serial markers
    Serial,
    /// Back-to-back messages (TCP capture)
    Raw,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("DLT Log CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using engine library v{}", dlt_log_engine::VERSION);

    match args.command {
        Command::Index { files, config, sort_by_time, no_filters, cache_dir, json } => {
            let mut app = match &config {
                Some(path) => config::load_config(path)?,
                None => config::AppConfig::default(),
            };
            if sort_by_time {
                app.engine.indexer.sort_by_time = true;
            }
            if no_filters {
                app.engine.indexer.filters_enabled = false;
            }
            if let Some(dir) = cache_dir {
                app.engine.indexer.cache_dir = Some(dir);
            }
            let summaries = index::index_files(&files, &app)?;
            index::print_summaries(&summaries, json)?;
        }
        Command::Scan { file, mode, json } => {
            let stats = scan::scan_file(&file, mode.into())
                .with_context(|| format!("Failed to scan {:?}", file))?;
            scan::print_stats(&file, &stats, json)?;
        }
        Command::Receive { config, output, duration } => {
            let mut app = config::load_config(&config)?;
            if let Some(path) = output {
                app.engine.connection.log_file = Some(path);
            }
            receive::run(&app, duration.map(std::time::Duration::from_secs))?;
        }
    }

    Ok(())
}

impl From<ScanMode> for dlt_log_engine::SyncMode {
    fn from(mode: ScanMode) -> Self {
        match mode {
            ScanMode::Storage => dlt_log_engine::SyncMode::Storage,
            ScanMode::Serial => dlt_log_engine::SyncMode::Serial,
            ScanMode::Raw => dlt_log_engine::SyncMode::Raw,
        }
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
