use std::env::current_dir;
use std::fs::{read_to_string, write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_string_pretty};

/// Name of the configuration file.
pub(crate) const CONFIG_NAME: &str = "config.json";

/// Name of the login file.
pub(crate) const LOGIN_NAME: &str = "login.json";

fn default_posts_per_page() -> u64 {
    50
}
fn default_max_consecutive_empty_pages() -> u32 {
    10
}
fn default_tag_cache_file() -> String {
    String::from("tag_cache.json")
}
fn default_posts_cache_file() -> String {
    String::from("posts_cache.json")
}
fn default_failed_posts_cache_file() -> String {
    String::from("failed_posts_cache.json")
}
fn default_rate_limited_posts_file() -> String {
    String::from("rate_limited_posts.json")
}
fn default_max_workers() -> usize {
    4
}
fn default_download_workers() -> usize {
    3
}
fn default_tag_batch_size() -> usize {
    20
}
fn default_min_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_delay_increase_factor() -> f64 {
    1.5
}
fn default_delay_decrease_factor() -> f64 {
    0.95
}
fn default_success_threshold() -> u32 {
    15
}

/// Config that is used to do general setup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct Config {
    /// How many favorites the remote service lists per page.
    #[serde(rename = "postsPerPage", default = "default_posts_per_page")]
    posts_per_page: u64,
    /// Stop after this many consecutive pages without a new download.
    #[serde(
        rename = "maxConsecutiveEmptyPages",
        default = "default_max_consecutive_empty_pages"
    )]
    max_consecutive_empty_pages: u32,
    /// Root of the output directory tree. Empty means the working directory.
    #[serde(rename = "baseDirectory", default)]
    base_directory: String,
    /// Backing file for the tag metadata cache.
    #[serde(rename = "tagCacheFile", default = "default_tag_cache_file")]
    tag_cache_file: String,
    /// Backing file for the processed-posts cache.
    #[serde(rename = "postsCacheFile", default = "default_posts_cache_file")]
    posts_cache_file: String,
    /// Backing file for permanently failed posts.
    #[serde(
        rename = "failedPostsCacheFile",
        default = "default_failed_posts_cache_file"
    )]
    failed_posts_cache_file: String,
    /// Backing file for the rate-limited tracking set.
    #[serde(
        rename = "rateLimitedPostsFile",
        default = "default_rate_limited_posts_file"
    )]
    rate_limited_posts_file: String,
    /// Upper bound on concurrent metadata fetch workers.
    #[serde(rename = "maxWorkers", default = "default_max_workers")]
    max_workers: usize,
    /// Concurrency level for image downloads.
    #[serde(rename = "downloadWorkers", default = "default_download_workers")]
    download_workers: usize,
    /// How many tag lookups are submitted per batch.
    #[serde(rename = "tagBatchSize", default = "default_tag_batch_size")]
    tag_batch_size: usize,
    /// Smallest enforced spacing between outbound requests.
    #[serde(rename = "minDelayMs", default = "default_min_delay_ms")]
    min_delay_ms: u64,
    /// Largest enforced spacing between outbound requests.
    #[serde(rename = "maxDelayMs", default = "default_max_delay_ms")]
    max_delay_ms: u64,
    /// Multiplier applied to the delay on a rate-limit response.
    #[serde(
        rename = "delayIncreaseFactor",
        default = "default_delay_increase_factor"
    )]
    delay_increase_factor: f64,
    /// Multiplier applied to the delay after a success streak.
    #[serde(
        rename = "delayDecreaseFactor",
        default = "default_delay_decrease_factor"
    )]
    delay_decrease_factor: f64,
    /// Consecutive successes required before the delay is eased off.
    #[serde(rename = "successThreshold", default = "default_success_threshold")]
    success_threshold: u32,
}

impl Config {
    pub(crate) fn posts_per_page(&self) -> u64 {
        self.posts_per_page
    }

    pub(crate) fn max_consecutive_empty_pages(&self) -> u32 {
        self.max_consecutive_empty_pages
    }

    /// Root of the output directory tree, falling back to the working directory.
    pub(crate) fn base_directory(&self) -> PathBuf {
        if self.base_directory.is_empty() {
            current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.base_directory)
        }
    }

    pub(crate) fn tag_cache_file(&self) -> &str {
        &self.tag_cache_file
    }

    pub(crate) fn posts_cache_file(&self) -> &str {
        &self.posts_cache_file
    }

    pub(crate) fn failed_posts_cache_file(&self) -> &str {
        &self.failed_posts_cache_file
    }

    pub(crate) fn rate_limited_posts_file(&self) -> &str {
        &self.rate_limited_posts_file
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers.max(1)
    }

    pub(crate) fn download_workers(&self) -> usize {
        self.download_workers.max(1)
    }

    pub(crate) fn tag_batch_size(&self) -> usize {
        self.tag_batch_size.max(1)
    }

    pub(crate) fn min_delay_ms(&self) -> u64 {
        self.min_delay_ms
    }

    pub(crate) fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub(crate) fn delay_increase_factor(&self) -> f64 {
        self.delay_increase_factor
    }

    pub(crate) fn delay_decrease_factor(&self) -> f64 {
        self.delay_decrease_factor
    }

    pub(crate) fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// Checks config and ensure it isn't missing.
    pub(crate) fn config_exists() -> bool {
        if !Path::new(CONFIG_NAME).exists() {
            trace!("config.json: does not exist!");
            return false;
        }

        true
    }

    /// Creates config file.
    pub(crate) fn create_config() -> Result<(), Error> {
        let json = to_string_pretty(&Config::default())?;
        write(Path::new(CONFIG_NAME), json)?;

        Ok(())
    }

    /// Loads and returns `config` for quick management and settings.
    pub(crate) fn load() -> Result<Self, Error> {
        let config_contents = read_to_string(CONFIG_NAME)
            .with_context(|| format!("Failed to read config file: {CONFIG_NAME}"))?;
        let config: Config = from_str(&config_contents)
            .with_context(|| format!("Failed to parse config file: {CONFIG_NAME}"))?;

        if config.min_delay_ms == 0 || config.min_delay_ms > config.max_delay_ms {
            anyhow::bail!(
                "Invalid rate-limiting configuration: minDelayMs must be nonzero and no \
                 greater than maxDelayMs"
            );
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            posts_per_page: default_posts_per_page(),
            max_consecutive_empty_pages: default_max_consecutive_empty_pages(),
            base_directory: String::new(),
            tag_cache_file: default_tag_cache_file(),
            posts_cache_file: default_posts_cache_file(),
            failed_posts_cache_file: default_failed_posts_cache_file(),
            rate_limited_posts_file: default_rate_limited_posts_file(),
            max_workers: default_max_workers(),
            download_workers: default_download_workers(),
            tag_batch_size: default_tag_batch_size(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            delay_increase_factor: default_delay_increase_factor(),
            delay_decrease_factor: default_delay_decrease_factor(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// `Login` contains all login information for authenticating against the service.
#[derive(Serialize, Deserialize, Clone)]
pub(crate) struct Login {
    /// Username of user.
    #[serde(rename = "Username")]
    username: String,
    /// Password used for the session-cookie login.
    #[serde(rename = "Password")]
    password: String,
    /// Numeric user id the favorites listing belongs to.
    #[serde(rename = "UserID")]
    user_id: String,
    /// The API key for authenticated metadata endpoints.
    #[serde(rename = "APIKey")]
    api_key: String,
}

impl Login {
    pub(crate) fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub(crate) fn user_id(&self) -> &str {
        &self.user_id
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn login_exists() -> bool {
        Path::new(LOGIN_NAME).exists()
    }

    /// Loads the login file or creates one if it doesn't exist.
    pub(crate) fn load() -> Result<Self, Error> {
        let login_path = Path::new(LOGIN_NAME);
        if login_path.exists() {
            let login: Login = from_str(&read_to_string(login_path)?)
                .with_context(|| format!("Failed to parse login file: {LOGIN_NAME}"))?;
            Ok(login)
        } else {
            let login = Login::default();
            login.create_login()?;
            Ok(login)
        }
    }

    /// Checks if any credential field is still empty.
    pub(crate) fn is_empty(&self) -> bool {
        self.username.is_empty()
            || self.password.is_empty()
            || self.user_id.is_empty()
            || self.api_key.is_empty()
    }

    /// Creates a new login file.
    fn create_login(&self) -> Result<(), Error> {
        write(LOGIN_NAME, to_string_pretty(self)?)?;

        info!("The login file was created.");
        info!(
            "Fill in your username, password, user id, and API key before running a sync."
        );
        info!(
            "Do not give out your API key unless you trust this software completely, \
             always treat your API key like your own password."
        );

        Ok(())
    }
}

impl Default for Login {
    /// The default state for the login if none exists.
    fn default() -> Self {
        Login {
            username: String::new(),
            password: String::new(),
            user_id: String::new(),
            api_key: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: Config = from_str("{}").unwrap();
        assert_eq!(config.posts_per_page(), 50);
        assert_eq!(config.max_consecutive_empty_pages(), 10);
        assert_eq!(config.max_workers(), 4);
        assert_eq!(config.download_workers(), 3);
        assert_eq!(config.tag_batch_size(), 20);
        assert_eq!(config.min_delay_ms(), 250);
        assert_eq!(config.max_delay_ms(), 5000);
        assert_eq!(config.success_threshold(), 15);
    }

    #[test]
    fn worker_counts_never_drop_to_zero() {
        let config: Config = from_str(r#"{"maxWorkers": 0, "downloadWorkers": 0}"#).unwrap();
        assert_eq!(config.max_workers(), 1);
        assert_eq!(config.download_workers(), 1);
    }

    #[test]
    fn empty_login_is_detected() {
        let login = Login::default();
        assert!(login.is_empty());

        let login: Login = from_str(
            r#"{"Username": "user", "Password": "pass", "UserID": "123", "APIKey": "key"}"#,
        )
        .unwrap();
        assert!(!login.is_empty());
    }
}
