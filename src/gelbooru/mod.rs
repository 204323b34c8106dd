use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Error};
use console::style;

use crate::gelbooru::cache::CacheStore;
use crate::gelbooru::downloader::PostDownloader;
use crate::gelbooru::fetcher::PostFetcher;
use crate::gelbooru::io::Config;
use crate::gelbooru::rate_limiter::{AdaptiveRateLimiter, RateLimiterConfig};
use crate::gelbooru::sender::RequestSender;

pub(crate) mod cache;
pub(crate) mod downloader;
pub(crate) mod fetcher;
pub(crate) mod io;
pub(crate) mod parser;
pub(crate) mod rate_limiter;
pub(crate) mod sender;

/// Retry budget for the favorites listing itself. Without a page of
/// identifiers nothing downstream can run, so it gets the full budget.
const PAGE_MAX_ATTEMPTS: u32 = 5;

const PAGE_BASE_BACKOFF: Duration = Duration::from_secs(5);

/// Where the sync loop currently is.
enum DriverState {
    /// Requesting the next page of favorite identifiers.
    Fetching { page: u64 },
    /// Running the metadata, tag, and download stages over one page.
    Processing { page: u64, ids: Vec<String> },
    Done,
}

/// Totals across a whole run, printed in the end-of-run summary.
#[derive(Debug, Default)]
struct RunSummary {
    pages: u64,
    downloaded: usize,
    existing: usize,
    cached: usize,
    failed: usize,
}

/// Drives the favorites sync: page iteration, the per-page stages, and
/// cache flushing at page boundaries.
pub(crate) struct GelbooruWebConnector {
    config: Config,
    sender: RequestSender,
    limiter: AdaptiveRateLimiter,
    cache: Arc<CacheStore>,
    shutdown: Arc<AtomicBool>,
}

impl GelbooruWebConnector {
    pub(crate) fn new(
        config: Config,
        sender: RequestSender,
        cache: Arc<CacheStore>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let limiter = AdaptiveRateLimiter::new(RateLimiterConfig::from_config(&config));
        GelbooruWebConnector {
            config,
            sender,
            limiter,
            cache,
            shutdown,
        }
    }

    /// Walks the account's favorites page by page until no new work remains.
    pub(crate) fn sync(&self) -> Result<(), Error> {
        self.sender
            .login()
            .context("Authentication failed; cannot sync favorites")?;
        info!("Logged in; starting favorites sync");

        let fetcher = PostFetcher::new(
            self.sender.clone(),
            &self.limiter,
            &self.cache,
            &self.config,
        )?;
        let downloader = PostDownloader::new(
            self.sender.clone(),
            &self.limiter,
            &self.cache,
            &self.config,
        )?;

        let mut summary = RunSummary::default();
        let mut consecutive_empty_pages: u32 = 0;
        let mut state = DriverState::Fetching { page: 0 };

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested; stopping after current page");
                break;
            }

            state = match state {
                DriverState::Fetching { page } => {
                    let ids = self.fetch_page_ids(page)?;
                    if ids.is_empty() {
                        info!("Page {page} is empty; favorites exhausted");
                        DriverState::Done
                    } else {
                        DriverState::Processing { page, ids }
                    }
                }
                DriverState::Processing { page, ids } => {
                    info!(
                        "Processing page {page} ({} favorites)...",
                        ids.len()
                    );
                    let short_page = (ids.len() as u64) < self.config.posts_per_page();

                    let fetched = fetcher.fetch_page(&ids);
                    fetcher.resolve_tags(&fetched.posts);
                    let tally = downloader.download_batch(&fetched.posts);

                    if let Err(e) = self.cache.flush() {
                        error!("Failed to flush caches after page {page}: {e}");
                    }

                    summary.pages += 1;
                    summary.downloaded += tally.downloaded;
                    summary.existing += tally.existing;
                    summary.cached += fetched.cached;
                    summary.failed += fetched.failed + tally.failed;

                    if tally.downloaded == 0 {
                        consecutive_empty_pages += 1;
                        info!(
                            "No new downloads on page {page} \
                             ({consecutive_empty_pages}/{} empty pages)",
                            self.config.max_consecutive_empty_pages()
                        );
                    } else {
                        consecutive_empty_pages = 0;
                    }

                    if short_page {
                        info!("Page {page} was short; reached the last page");
                        DriverState::Done
                    } else if consecutive_empty_pages
                        >= self.config.max_consecutive_empty_pages()
                    {
                        info!("Favorites appear fully synced; stopping");
                        DriverState::Done
                    } else {
                        DriverState::Fetching { page: page + 1 }
                    }
                }
                DriverState::Done => break,
            };
        }

        self.cache.flush()?;
        self.print_summary(&summary);
        Ok(())
    }

    /// Re-runs the metadata and download stages over every identifier in the
    /// permanent-failure set. Successes leave the set; new failures refresh
    /// their recorded reason.
    pub(crate) fn retry_failed(&self) -> Result<(), Error> {
        let failures = self.cache.failures();
        if failures.is_empty() {
            info!("No permanently failed posts to retry");
            return Ok(());
        }

        self.sender
            .login()
            .context("Authentication failed; cannot retry failed posts")?;
        info!("Retrying {} permanently failed posts...", failures.len());

        let fetcher = PostFetcher::new(
            self.sender.clone(),
            &self.limiter,
            &self.cache,
            &self.config,
        )?;
        let downloader = PostDownloader::new(
            self.sender.clone(),
            &self.limiter,
            &self.cache,
            &self.config,
        )?;

        let ids: Vec<String> = failures.keys().cloned().collect();
        let fetched = fetcher.fetch_page(&ids);
        fetcher.resolve_tags(&fetched.posts);
        let tally = downloader.download_batch(&fetched.posts);
        self.cache.flush()?;

        let remaining = self.cache.failures().len();
        info!(
            "Retry complete: {} recovered, {} still failed",
            style(tally.downloaded + tally.existing).green(),
            remaining
        );
        Ok(())
    }

    /// Prints current cache and failure state. Issues no network calls.
    pub(crate) fn status(&self) {
        let failures = self.cache.failures();
        let rate_limited = self.cache.rate_limited();

        println!(
            "Processed posts:     {}",
            style(self.cache.processed_count()).green()
        );
        println!("Permanently failed:  {}", style(failures.len()).red());
        for (id, record) in &failures {
            println!("  {id}: [{}] {}", record.kind, record.message);
        }
        println!("Rate-limited (seen): {}", style(rate_limited.len()).yellow());
        for id in &rate_limited {
            println!("  {id}");
        }
    }

    /// Fetches and parses one favorites page, with the usual retry budget.
    fn fetch_page_ids(&self, page: u64) -> Result<Vec<String>, Error> {
        let pid = page * self.config.posts_per_page();

        for attempt in 0..PAGE_MAX_ATTEMPTS {
            self.limiter.admit();
            match self.sender.favorites_page(pid) {
                Ok(html) => {
                    self.limiter.on_success();
                    return Ok(parser::favorite_post_ids(&html));
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        warn!("Rate limited while listing favorites page {page}");
                        self.limiter.on_rate_limited();
                    }

                    if attempt + 1 < PAGE_MAX_ATTEMPTS {
                        let backoff = PAGE_BASE_BACKOFF * 2u32.pow(attempt);
                        info!(
                            "Favorites page {page}: {e}. Retrying after {backoff:?} \
                             (attempt {}/{PAGE_MAX_ATTEMPTS})",
                            attempt + 1
                        );
                        sleep(backoff);
                    } else {
                        return Err(Error::from(e)).with_context(|| {
                            format!(
                                "Failed to fetch favorites page {page} after \
                                 {PAGE_MAX_ATTEMPTS} attempts"
                            )
                        });
                    }
                }
            }
        }

        Ok(Vec::new())
    }

    fn print_summary(&self, summary: &RunSummary) {
        info!(
            "Sync finished: {} pages, {} downloaded, {} already on disk, \
             {} cached, {} failed",
            summary.pages,
            style(summary.downloaded).green(),
            summary.existing,
            summary.cached,
            summary.failed
        );

        let failures = self.cache.failures();
        if !failures.is_empty() {
            warn!("{} posts remain permanently failed:", failures.len());
            for (id, record) in &failures {
                warn!("  {id}: [{}] {}", record.kind, record.message);
            }
        }

        let rate_limited = self.cache.rate_limited();
        if !rate_limited.is_empty() {
            warn!(
                "{} posts were rate limited at last attempt: {}",
                rate_limited.len(),
                rate_limited.join(", ")
            );
        }
    }
}
