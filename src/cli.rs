//! Binary entry point. Parses arguments, validates them into a [`Config`], brings up logging,
//! and hands off to [`Driver`]. Kept thin on purpose — everything with a decision to make lives
//! in the modules it delegates to.

use clap::Parser;

use crate::config::{Cli, Config};
use crate::driver::Driver;
use crate::logging::{init_logging, LogConfig};

pub fn run() -> i32 {
    let cli = Cli::parse();

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fscrawl: {e}");
            return 1;
        }
    };

    let log_config = match &config.logfile {
        Some(path) => LogConfig::file(config.loglevel, path.clone()),
        None => LogConfig::console(config.loglevel),
    };
    let _logging_guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("fscrawl: failed to initialize logging: {e}");
            return 1;
        }
    };

    match Driver::new(config).run() {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "operation failed");
            1
        }
    }
}
