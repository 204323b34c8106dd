use std::env::current_dir;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Error};
use clap::{Parser, Subcommand};
use console::Term;

use crate::gelbooru::cache::CacheStore;
use crate::gelbooru::io::{Config, Login};
use crate::gelbooru::sender::RequestSender;
use crate::gelbooru::GelbooruWebConnector;

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = NAME, version = VERSION, about = "Downloads and organizes your Gelbooru favorites")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Walk the favorites listing and download anything new
    Sync,
    /// Re-attempt every post in the permanent-failure set
    RetryFailed,
    /// Show cache, failure, and rate-limit state without going online
    Status,
}

/// A program class that handles the flow of the downloader user experience and steps of execution.
pub(crate) struct Program {
    cli: Cli,
}

impl Program {
    /// Creates a new instance of the program.
    pub(crate) fn new() -> Self {
        Program { cli: Cli::parse() }
    }

    /// Runs the downloader program.
    pub(crate) fn run(&self) -> Result<(), Error> {
        Term::stdout().set_title("gelbooru downloader");
        trace!("Starting gelbooru downloader...");
        trace!("Program Name: {NAME}");
        trace!("Program Version: {VERSION}");

        let working_dir = current_dir().context("Unable to get working directory")?;
        trace!("Program Working Directory: {}", working_dir.display());

        if !Config::config_exists() {
            info!("Creating config file...");
            Config::create_config()?;
            info!(
                "A default config file has been created. Review it, then run the program again."
            );
            return Ok(());
        }
        let config = Config::load()?;

        if !Login::login_exists() {
            // load() writes the template when the file is missing.
            Login::load()?;
            info!(
                "Fill in the login file with your username, password, user ID, and API key, \
                 then run the program again."
            );
            return Ok(());
        }
        let login = Login::load()?;
        if login.is_empty() {
            anyhow::bail!(
                "The login file is incomplete; username, password, user ID, and API key are \
                 all required"
            );
        }
        trace!("Login Username: {}", login.username());
        trace!("Login API Key: {}", "*".repeat(login.api_key().len()));

        let sender = RequestSender::new(&login)?;
        let cache = Arc::new(CacheStore::load(&working_dir, &config));
        let shutdown = Arc::new(AtomicBool::new(false));
        Self::install_interrupt_handler(Arc::clone(&cache), Arc::clone(&shutdown))?;

        let connector = GelbooruWebConnector::new(config, sender, cache, shutdown);
        match self.cli.command.as_ref().unwrap_or(&Command::Sync) {
            Command::Sync => connector.sync()?,
            Command::RetryFailed => connector.retry_failed()?,
            Command::Status => connector.status(),
        }

        Ok(())
    }

    /// On Ctrl+C, flush whatever the page buffers hold and get out. In-flight
    /// requests are abandoned; the durable caches make the next run resume
    /// where this one stopped.
    fn install_interrupt_handler(
        cache: Arc<CacheStore>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), Error> {
        ctrlc::set_handler(move || {
            if shutdown.swap(true, Ordering::SeqCst) {
                // Second interrupt: the user wants out now.
                exit(1);
            }
            warn!("Interrupted; flushing caches before exit...");
            if let Err(e) = cache.flush() {
                error!("Failed to flush caches during shutdown: {e}");
            }
            exit(0);
        })
        .context("Failed to install the interrupt handler")
    }
}
