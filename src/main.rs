#[macro_use]
extern crate log;

use std::env::consts::{ARCH, FAMILY, OS};
use std::fs::OpenOptions;

use anyhow::Error;
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, TermLogger, TerminalMode, WriteLogger,
};

use crate::program::Program;

mod gelbooru;
mod program;

fn main() -> Result<(), Error> {
    initialize_logger();
    log_system_information();

    let program = Program::new();
    program.run()
}

/// Initializes the logger with preset filtering.
fn initialize_logger() {
    let mut config = ConfigBuilder::new();
    config.add_filter_allow_str("gelbooru_downloader");

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("gelbooru_downloader.log");

    let init_result = match log_file {
        Ok(file) => CombinedLogger::init(vec![
            TermLogger::new(
                LevelFilter::Info,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            ),
            WriteLogger::new(LevelFilter::max(), config.build(), file),
        ]),
        Err(e) => {
            eprintln!("Failed to open log file: {e}. Logging to terminal only.");
            TermLogger::init(
                LevelFilter::Info,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            )
        }
    };

    if let Err(e) = init_result {
        eprintln!("Failed to initialize logger: {e}");
    }
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("ARCH:   \"{ARCH}\"");
    trace!("FAMILY: \"{FAMILY}\"");
    trace!("OS:     \"{OS}\"");
}
