use std::collections::BTreeSet;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Error};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::gelbooru::cache::{CacheStore, FailureKind, TagRecord};
use crate::gelbooru::io::Config;
use crate::gelbooru::rate_limiter::AdaptiveRateLimiter;
use crate::gelbooru::sender::entries::{PostEntry, TagEntry};
use crate::gelbooru::sender::RequestSender;

/// Retry budget for post metadata fetches.
const POST_MAX_ATTEMPTS: u32 = 5;

/// First backoff step for post metadata fetches.
const POST_BASE_BACKOFF: Duration = Duration::from_secs(5);

/// Batch tag lookups are lower priority and get a smaller budget.
const TAG_MAX_ATTEMPTS: u32 = 3;

const TAG_BASE_BACKOFF: Duration = Duration::from_secs(2);

/// Extra breather between tag batches, on top of the per-call admit gate.
const TAG_BATCH_PAUSE: Duration = Duration::from_millis(500);

/// What became of one post's metadata fetch.
#[derive(Debug)]
pub(crate) enum FetchOutcome {
    /// A full record came back.
    Resolved(PostEntry),
    /// The post was already processed; no request was issued.
    Skipped,
    /// The service answered but has no record (deleted or inaccessible).
    /// Terminal for this run, cached nowhere.
    NotFound,
    /// The retry budget ran out; recorded in the permanent failure set.
    Failed,
}

/// Tally of one page's metadata fetches.
#[derive(Debug, Default)]
pub(crate) struct PageFetch {
    pub(crate) posts: Vec<PostEntry>,
    pub(crate) cached: usize,
    pub(crate) not_found: usize,
    pub(crate) failed: usize,
}

/// Resolves post records and tag records for one page at a time, deduplicating
/// against the cache before any network call is issued.
pub(crate) struct PostFetcher<'a> {
    sender: RequestSender,
    limiter: &'a AdaptiveRateLimiter,
    cache: &'a CacheStore,
    pool: ThreadPool,
    tag_batch_size: usize,
}

impl<'a> PostFetcher<'a> {
    pub(crate) fn new(
        sender: RequestSender,
        limiter: &'a AdaptiveRateLimiter,
        cache: &'a CacheStore,
        config: &Config,
    ) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.max_workers())
            .build()
            .context("Failed to create metadata fetch thread pool")?;

        Ok(PostFetcher {
            sender,
            limiter,
            cache,
            pool,
            tag_batch_size: config.tag_batch_size(),
        })
    }

    /// Fetches records for every identifier on a page that is not already
    /// processed. Work is submitted in waves sized by the rate controller's
    /// current worker cap, so a mid-page backoff shrinks the next wave.
    pub(crate) fn fetch_page(&self, ids: &[String]) -> PageFetch {
        let fresh = fresh_ids(self.cache, ids);
        let mut page = PageFetch {
            cached: ids.len() - fresh.len(),
            ..PageFetch::default()
        };
        if fresh.is_empty() {
            info!("All {} posts on this page are already cached", ids.len());
            return page;
        }

        info!(
            "Fetching details for {} posts ({} cached) using up to {} workers...",
            fresh.len(),
            page.cached,
            self.limiter.current_workers()
        );
        let progress = fetch_progress_bar(fresh.len() as u64);

        let (tx, rx) = flume::unbounded();
        let mut remaining = fresh.as_slice();
        while !remaining.is_empty() {
            let wave = self
                .limiter
                .current_workers()
                .max(1)
                .min(remaining.len());
            let (chunk, rest) = remaining.split_at(wave);
            remaining = rest;

            self.pool.scope(|scope| {
                for id in chunk {
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        let outcome = self.fetch_post(id);
                        // The page is torn down only after the scope joins,
                        // so the receiver cannot be gone yet.
                        let _ = tx.send(outcome);
                    });
                }
            });

            for outcome in rx.try_iter() {
                match outcome {
                    FetchOutcome::Resolved(post) => page.posts.push(post),
                    FetchOutcome::Skipped => page.cached += 1,
                    FetchOutcome::NotFound => page.not_found += 1,
                    FetchOutcome::Failed => page.failed += 1,
                }
                progress.inc(1);
                progress.set_message(format!(
                    "new: {}, cached: {}, failed: {}",
                    page.posts.len(),
                    page.cached,
                    page.failed
                ));
            }
        }
        drop(tx);

        progress.finish_and_clear();
        info!(
            "Page fetched: {} new, {} cached, {} missing, {} failed",
            page.posts.len(),
            page.cached,
            page.not_found,
            page.failed
        );
        page
    }

    /// Fetches one post record with retries, feeding every outcome back into
    /// the rate controller.
    fn fetch_post(&self, id: &str) -> FetchOutcome {
        if self.cache.is_processed(id) {
            return FetchOutcome::Skipped;
        }

        for attempt in 0..POST_MAX_ATTEMPTS {
            self.limiter.admit();
            match self.sender.post_entry(id) {
                Ok(Some(post)) => {
                    self.limiter.on_success();
                    self.cache.remove_rate_limited(id);
                    if attempt > 0 {
                        info!(
                            "Successfully retrieved post {id} after {} attempts",
                            attempt + 1
                        );
                    }
                    return FetchOutcome::Resolved(post);
                }
                Ok(None) => {
                    self.limiter.on_success();
                    self.cache.remove_rate_limited(id);
                    trace!("Post {id} has no record; treating as deleted");
                    return FetchOutcome::NotFound;
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        self.cache.add_rate_limited(id);
                        warn!(
                            "Rate limit hit for post {id} - attempt {}/{POST_MAX_ATTEMPTS}",
                            attempt + 1
                        );
                        self.limiter.on_rate_limited();
                    }

                    if attempt + 1 < POST_MAX_ATTEMPTS {
                        let backoff = POST_BASE_BACKOFF * 2u32.pow(attempt);
                        info!(
                            "Post {id}: {e}. Retrying after {backoff:?} (attempt {}/{POST_MAX_ATTEMPTS})",
                            attempt + 1
                        );
                        sleep(backoff);
                    } else {
                        error!("Failed to get post {id} after {POST_MAX_ATTEMPTS} attempts: {e}");
                        self.cache
                            .record_failure(id, FailureKind::Api, e.to_string());
                        self.cache.remove_rate_limited(id);
                        return FetchOutcome::Failed;
                    }
                }
            }
        }

        FetchOutcome::Failed
    }

    /// Resolves every tag the page's new posts reference that is not already
    /// cached, in capped-size batches. A tag that cannot be resolved is
    /// omitted this run; it stays absent from the cache and will be retried
    /// on a future run.
    pub(crate) fn resolve_tags(&self, posts: &[PostEntry]) -> usize {
        let wanted = tags_to_resolve(self.cache, posts);
        if wanted.is_empty() {
            return 0;
        }

        info!("Fetching {} new tag details...", wanted.len());
        let progress = fetch_progress_bar(wanted.len() as u64);
        let mut resolved = 0usize;

        let total_batches = wanted.len().div_ceil(self.tag_batch_size);
        for (index, batch) in wanted.chunks(self.tag_batch_size).enumerate() {
            let (tx, rx) = flume::unbounded();

            let mut remaining = batch;
            while !remaining.is_empty() {
                let wave = self
                    .limiter
                    .current_workers()
                    .max(1)
                    .min(remaining.len());
                let (chunk, rest) = remaining.split_at(wave);
                remaining = rest;

                self.pool.scope(|scope| {
                    for tag in chunk {
                        let tx = tx.clone();
                        scope.spawn(move |_| {
                            let entry = self.fetch_tag(tag);
                            let _ = tx.send((tag.as_str(), entry));
                        });
                    }
                });
            }
            drop(tx);

            for (tag, entry) in rx.iter() {
                if let Some(entry) = entry {
                    self.cache.stage_tag(tag, TagRecord::from(entry));
                    resolved += 1;
                }
                progress.inc(1);
            }

            if index + 1 < total_batches {
                sleep(TAG_BATCH_PAUSE);
            }
        }

        progress.finish_and_clear();
        info!("Resolved {resolved}/{} tags", wanted.len());
        resolved
    }

    /// Fetches one tag record. Same classification as posts, smaller budget,
    /// no permanent-failure bookkeeping.
    fn fetch_tag(&self, tag: &str) -> Option<TagEntry> {
        for attempt in 0..TAG_MAX_ATTEMPTS {
            self.limiter.admit();
            match self.sender.tag_entry(tag) {
                Ok(entry) => {
                    self.limiter.on_success();
                    return entry;
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        self.limiter.on_rate_limited();
                    }

                    if attempt + 1 < TAG_MAX_ATTEMPTS {
                        let backoff = TAG_BASE_BACKOFF * 2u32.pow(attempt);
                        trace!("Tag \"{tag}\": {e}. Retrying after {backoff:?}");
                        sleep(backoff);
                    } else {
                        warn!("Skipping tag \"{tag}\" this run: {e}");
                    }
                }
            }
        }

        None
    }
}

/// Identifiers on the page that still need a metadata fetch.
fn fresh_ids(cache: &CacheStore, ids: &[String]) -> Vec<String> {
    ids.iter()
        .filter(|id| !cache.is_processed(id))
        .cloned()
        .collect()
}

/// The union of tags referenced by the given posts, minus everything already
/// cached durably or staged in the buffer.
fn tags_to_resolve(cache: &CacheStore, posts: &[PostEntry]) -> Vec<String> {
    let mut wanted = BTreeSet::new();
    for post in posts {
        for tag in post.tags.split_whitespace() {
            if !cache.has_tag(tag) {
                wanted.insert(tag.to_string());
            }
        }
    }
    wanted.into_iter().collect()
}

fn fetch_progress_bar(len: u64) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template("{spinner} [{bar:20}] {pos}/{len} ({msg})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    let progress = ProgressBar::new(len);
    progress.set_style(style);
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gelbooru::sender::entries::{Rating, TAG_KIND_CHARACTER};
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn scratch_store() -> (PathBuf, CacheStore) {
        let dir = std::env::temp_dir().join(format!("gelbooru_fetch_test_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let store = CacheStore::load(&dir, &Config::default());
        (dir, store)
    }

    fn post(id: i64, tags: &str) -> PostEntry {
        PostEntry {
            id,
            file_url: format!("https://img.example/{id}.png"),
            tags: tags.to_string(),
            rating: Rating::General,
        }
    }

    #[test]
    fn processed_ids_are_filtered_before_any_fetch() {
        let (dir, store) = scratch_store();
        store.mark_processed("123");

        let ids = vec![String::from("123"), String::from("456")];
        assert_eq!(fresh_ids(&store, &ids), vec!["456"]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tag_union_is_deduplicated_and_cache_filtered() {
        let (dir, store) = scratch_store();
        store.stage_tag(
            "known_tag",
            TagRecord {
                kind: TAG_KIND_CHARACTER,
                name: String::from("known_tag"),
            },
        );

        let posts = vec![
            post(1, "known_tag alpha beta"),
            post(2, "beta gamma"),
            post(3, ""),
        ];
        assert_eq!(tags_to_resolve(&store, &posts), vec!["alpha", "beta", "gamma"]);
        fs::remove_dir_all(&dir).unwrap();
    }
}
