//! safeshift command-line tool
//!
//! Plans, validates and applies schema changes against PostgreSQL or SQLite.
//! Exit codes: 0 success, 1 failure, 2 blocked by safety checks, 3 failed and
//! rolled back, 4 manual intervention required.

mod commands;
mod config;
mod error;
mod formatter;

use clap::Parser;
use config::{Args, LogFormat};
use formatter::Formatter;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "safeshift=info,safeshift_core=info";

fn main() {
    let args = Args::parse();
    init_tracing(args.log_format);

    let formatter = Formatter::new(args.format);
    let status = match commands::run(&args, &formatter) {
        Ok(status) => status,
        Err(e) => {
            if let Some(details) = commands::describe_failure(&e, &formatter) {
                println!("{}", details);
            }
            eprintln!("Error: {}", e);
            e.exit_status()
        }
    };

    std::process::exit(status.code());
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
