pub(crate) mod entries;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use thiserror::Error as ThisError;

use crate::gelbooru::io::Login;
use crate::gelbooru::sender::entries::{PostEntry, PostResponse, TagEntry, TagResponse};

/// Base URL every endpoint hangs off of.
const BASE_URL: &str = "https://gelbooru.com/index.php";

/// Timeout applied to every request made through the sender.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Classified outcome of a failed request. Rate limits are kept separate from
/// other failures because the rate controller reacts to them differently.
#[derive(Debug, ThisError)]
pub(crate) enum RequestError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("unexpected HTTP status {0}")]
    Status(StatusCode),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl RequestError {
    pub(crate) fn is_rate_limited(&self) -> bool {
        matches!(self, RequestError::RateLimited)
    }
}

/// Undoes the HTML entity escaping the service applies to tag strings before
/// they are sent back through the tag-detail endpoint.
fn decode_tag_entities(tag: &str) -> String {
    tag.replace("&#039;", "'")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// A sender that handles all outbound calls to the remote service. Cloning is
/// cheap and clones share the underlying client and its cookie session.
#[derive(Clone)]
pub(crate) struct RequestSender {
    client: Arc<Client>,
    login: Arc<Login>,
}

impl RequestSender {
    pub(crate) fn new(login: &Login) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(RequestSender {
            client: Arc::new(client),
            login: Arc::new(login.clone()),
        })
    }

    /// Authenticates the session against the login form. Nothing useful can
    /// run without a session, so a failure here is fatal to the whole run.
    pub(crate) fn login(&self) -> Result<(), Error> {
        let response = self
            .client
            .post(BASE_URL)
            .query(&[("page", "account"), ("s", "login"), ("code", "00")])
            .form(&[
                ("user", self.login.username()),
                ("pass", self.login.password()),
                ("submit", "Log in"),
            ])
            .send()
            .context("Login request could not be sent")?;
        response
            .error_for_status()
            .context("Login was rejected by the server")?;

        trace!("Session cookie obtained for {}", self.login.username());
        Ok(())
    }

    /// The status code is always classified before the body is touched so
    /// every caller sees the same error ordering.
    fn check_status(response: &reqwest::blocking::Response) -> Result<(), RequestError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RequestError::RateLimited);
        }
        if !status.is_success() {
            return Err(RequestError::Status(status));
        }
        Ok(())
    }

    /// Fetches the raw HTML of one favorites listing page at the given cursor.
    pub(crate) fn favorites_page(&self, pid: u64) -> Result<String, RequestError> {
        let response = self
            .client
            .get(BASE_URL)
            .query(&[
                ("page", "favorites"),
                ("s", "view"),
                ("id", self.login.user_id()),
                ("pid", &pid.to_string()),
            ])
            .send()?;
        Self::check_status(&response)?;
        Ok(response.text()?)
    }

    /// Fetches the record for a single post. An absent payload means the post
    /// was deleted or is inaccessible, which is a terminal non-error.
    pub(crate) fn post_entry(&self, id: &str) -> Result<Option<PostEntry>, RequestError> {
        let response = self
            .client
            .get(BASE_URL)
            .query(&[
                ("page", "dapi"),
                ("s", "post"),
                ("q", "index"),
                ("json", "1"),
                ("id", id),
                ("api_key", self.login.api_key()),
                ("user_id", self.login.user_id()),
            ])
            .send()?;
        Self::check_status(&response)?;

        let body = response.text()?;
        let parsed: PostResponse = serde_json::from_str(&body)?;
        Ok(parsed.into_entry())
    }

    /// Fetches the record for a single tag by name.
    pub(crate) fn tag_entry(&self, tag: &str) -> Result<Option<TagEntry>, RequestError> {
        let decoded = decode_tag_entities(tag);
        let response = self
            .client
            .get(BASE_URL)
            .query(&[
                ("page", "dapi"),
                ("s", "tag"),
                ("q", "index"),
                ("json", "1"),
                ("name", decoded.as_str()),
                ("api_key", self.login.api_key()),
                ("user_id", self.login.user_id()),
            ])
            .send()?;
        Self::check_status(&response)?;

        let body = response.text()?;
        let parsed: TagResponse = serde_json::from_str(&body)?;
        Ok(parsed.into_entry())
    }

    /// Downloads the bytes of a media file.
    pub(crate) fn download(&self, url: &str) -> Result<Vec<u8>, RequestError> {
        let response = self.client.get(url).send()?;
        Self::check_status(&response)?;
        Ok(response.bytes()?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_entities_are_decoded() {
        assert_eq!(decode_tag_entities("girl&#039;s_side"), "girl's_side");
        assert_eq!(decode_tag_entities("a&amp;b"), "a&b");
        assert_eq!(decode_tag_entities("&lt;3"), "<3");
        assert_eq!(decode_tag_entities("plain_tag"), "plain_tag");
    }

    #[test]
    fn rate_limit_errors_are_distinguished() {
        assert!(RequestError::RateLimited.is_rate_limited());
        assert!(!RequestError::Status(StatusCode::INTERNAL_SERVER_ERROR).is_rate_limited());
    }
}
