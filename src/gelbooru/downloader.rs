use std::fs::{create_dir_all, write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::gelbooru::cache::{CacheStore, FailureKind};
use crate::gelbooru::io::Config;
use crate::gelbooru::rate_limiter::AdaptiveRateLimiter;
use crate::gelbooru::sender::entries::PostEntry;
use crate::gelbooru::sender::RequestSender;

/// Characters Windows forbids in path components.
const INVALID_PATH_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Where an image file lands relative to the collection root, before the
/// sensitivity subfolder is applied.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FolderClassification {
    pub(crate) base: String,
    pub(crate) qualifier: Option<String>,
}

/// Tally of one page's downloads.
#[derive(Debug, Default)]
pub(crate) struct DownloadTally {
    pub(crate) downloaded: usize,
    pub(crate) existing: usize,
    pub(crate) failed: usize,
}

/// Saves resolved posts to disk, sorted into character/sensitivity folders.
pub(crate) struct PostDownloader<'a> {
    sender: RequestSender,
    limiter: &'a AdaptiveRateLimiter,
    cache: &'a CacheStore,
    pool: ThreadPool,
    base_directory: PathBuf,
}

impl<'a> PostDownloader<'a> {
    pub(crate) fn new(
        sender: RequestSender,
        limiter: &'a AdaptiveRateLimiter,
        cache: &'a CacheStore,
        config: &Config,
    ) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.download_workers())
            .build()
            .context("Failed to create download thread pool")?;

        Ok(PostDownloader {
            sender,
            limiter,
            cache,
            pool,
            base_directory: config.base_directory(),
        })
    }

    /// Downloads every post in the batch that is not already on disk,
    /// marking each satisfied post as processed.
    pub(crate) fn download_batch(&self, posts: &[PostEntry]) -> DownloadTally {
        if posts.is_empty() {
            return DownloadTally::default();
        }

        info!("Downloading {} posts...", posts.len());
        let progress = download_progress_bar(posts.len() as u64);

        let (tx, rx) = flume::unbounded();
        self.pool.scope(|scope| {
            for post in posts {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let _ = tx.send(self.save_post(post));
                });
            }
        });
        drop(tx);

        let mut tally = DownloadTally::default();
        for result in rx.iter() {
            match result {
                SaveResult::Downloaded => tally.downloaded += 1,
                SaveResult::AlreadyOnDisk => tally.existing += 1,
                SaveResult::Failed => tally.failed += 1,
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        if tally.failed > 0 {
            warn!(
                "{} of {} downloads failed this batch",
                tally.failed,
                posts.len()
            );
        }
        info!(
            "Batch complete: {} downloaded, {} already on disk, {} failed",
            style(tally.downloaded).green(),
            tally.existing,
            tally.failed
        );
        tally
    }

    /// Downloads a single post's file, or recognizes it as already present.
    fn save_post(&self, post: &PostEntry) -> SaveResult {
        let id = post.id.to_string();
        let Some(file_name) = post.file_name() else {
            error!("Post {id} has a file URL with no file name: {}", post.file_url);
            self.cache.record_failure(
                &id,
                FailureKind::Download,
                format!("file URL has no file name: {}", post.file_url),
            );
            return SaveResult::Failed;
        };

        let classification = classify_folder(self.cache, &post.tags);
        let path = destination_path(
            &self.base_directory,
            &classification,
            post.rating.as_folder(),
            file_name,
        );

        if path.exists() {
            trace!("Skipping {file_name} for post {id}: already on disk");
            self.cache.mark_processed(&id);
            self.cache.clear_failure(&id);
            return SaveResult::AlreadyOnDisk;
        }

        self.limiter.admit();
        match self.fetch_and_write(post, &path) {
            Ok(()) => {
                self.limiter.on_success();
                self.cache.mark_processed(&id);
                self.cache.clear_failure(&id);
                trace!("Saved {file_name} for post {id}");
                SaveResult::Downloaded
            }
            Err(e) => {
                error!("Error downloading {file_name} for post {id}: {e}");
                self.cache
                    .record_failure(&id, FailureKind::Download, e.to_string());
                SaveResult::Failed
            }
        }
    }

    fn fetch_and_write(&self, post: &PostEntry, path: &Path) -> Result<(), Error> {
        let bytes = self.sender.download(&post.file_url).map_err(|e| {
            if e.is_rate_limited() {
                self.limiter.on_rate_limited();
            }
            e
        })?;

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }
}

enum SaveResult {
    Downloaded,
    AlreadyOnDisk,
    Failed,
}

/// Replaces characters that cannot appear in a Windows path component.
pub(crate) fn sanitize_for_path(name: &str) -> String {
    name.chars()
        .map(|c| if INVALID_PATH_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Derives the folder a post belongs in from its resolved tags. A single
/// character gets its own folder; several characters share "Multiple",
/// qualified by the copyright name when exactly one distinct copyright tag
/// is present; no characters at all land in "No Character".
pub(crate) fn classify_folder(cache: &CacheStore, tags: &str) -> FolderClassification {
    let mut characters = Vec::new();
    let mut copyrights = Vec::new();
    for tag in tags.split_whitespace() {
        if let Some(record) = cache.tag(tag) {
            if record.is_character() {
                characters.push(record.name);
            } else if record.is_copyright() && !copyrights.contains(&record.name) {
                copyrights.push(record.name);
            }
        }
    }

    match characters.len() {
        0 => FolderClassification {
            base: String::from("No Character"),
            qualifier: None,
        },
        1 => FolderClassification {
            base: characters[0].replace(':', "-"),
            qualifier: None,
        },
        _ => FolderClassification {
            base: String::from("Multiple"),
            qualifier: match copyrights.as_slice() {
                [only] => Some(only.replace(':', "-")),
                _ => None,
            },
        },
    }
}

/// Builds `<base_dir>/<folder>[/<qualifier>]/<sensitivity>/<file_name>`.
pub(crate) fn destination_path(
    base_dir: &Path,
    classification: &FolderClassification,
    sensitivity: &str,
    file_name: &str,
) -> PathBuf {
    let mut path = base_dir.join(sanitize_for_path(&classification.base));
    if let Some(qualifier) = &classification.qualifier {
        path.push(sanitize_for_path(qualifier));
    }
    path.push(sensitivity);
    path.push(file_name);
    path
}

fn download_progress_bar(len: u64) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template("{spinner} [{bar:20}] {pos}/{len} downloaded")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    let progress = ProgressBar::new(len);
    progress.set_style(style);
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gelbooru::cache::TagRecord;
    use crate::gelbooru::sender::entries::{TAG_KIND_CHARACTER, TAG_KIND_COPYRIGHT};
    use std::fs;
    use uuid::Uuid;

    fn store_with_tags(tags: &[(&str, i64)]) -> (PathBuf, CacheStore) {
        let dir = std::env::temp_dir().join(format!("gelbooru_dl_test_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let store = CacheStore::load(&dir, &Config::default());
        for (name, kind) in tags {
            store.stage_tag(
                name,
                TagRecord {
                    kind: *kind,
                    name: name.to_string(),
                },
            );
        }
        (dir, store)
    }

    #[test]
    fn sanitization_replaces_forbidden_characters() {
        assert_eq!(sanitize_for_path(r#"a<b>c:d"e/f\g|h?i*j"#), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_for_path("plain_name"), "plain_name");
    }

    #[test]
    fn no_character_tags_use_the_fallback_folder() {
        let (dir, store) = store_with_tags(&[("scenery", 0)]);
        let classification = classify_folder(&store, "scenery unknown_tag");
        assert_eq!(classification.base, "No Character");
        assert_eq!(classification.qualifier, None);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn single_character_gets_its_own_folder() {
        let (dir, store) = store_with_tags(&[("hero:alt", TAG_KIND_CHARACTER)]);
        let classification = classify_folder(&store, "hero:alt scenery");
        assert_eq!(classification.base, "hero-alt");
        assert_eq!(classification.qualifier, None);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn multiple_characters_qualified_by_lone_copyright() {
        let (dir, store) = store_with_tags(&[
            ("hero", TAG_KIND_CHARACTER),
            ("rival", TAG_KIND_CHARACTER),
            ("some_series", TAG_KIND_COPYRIGHT),
        ]);
        let classification = classify_folder(&store, "hero rival some_series");
        assert_eq!(classification.base, "Multiple");
        assert_eq!(classification.qualifier.as_deref(), Some("some_series"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn multiple_copyrights_leave_the_shared_folder_unqualified() {
        let (dir, store) = store_with_tags(&[
            ("hero", TAG_KIND_CHARACTER),
            ("rival", TAG_KIND_CHARACTER),
            ("series_a", TAG_KIND_COPYRIGHT),
            ("series_b", TAG_KIND_COPYRIGHT),
        ]);
        let classification = classify_folder(&store, "hero rival series_a series_b");
        assert_eq!(classification.base, "Multiple");
        assert_eq!(classification.qualifier, None);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn destination_includes_qualifier_and_sensitivity() {
        let classification = FolderClassification {
            base: String::from("Multiple"),
            qualifier: Some(String::from("some_series")),
        };
        let path = destination_path(
            Path::new("/collection"),
            &classification,
            "Questionable",
            "abcd.png",
        );
        assert_eq!(
            path,
            Path::new("/collection/Multiple/some_series/Questionable/abcd.png")
        );
    }

    #[test]
    fn destination_without_qualifier_is_flat() {
        let classification = FolderClassification {
            base: String::from("hero"),
            qualifier: None,
        };
        let path = destination_path(Path::new("/collection"), &classification, "General", "x.gif");
        assert_eq!(path, Path::new("/collection/hero/General/x.gif"));
    }
}
