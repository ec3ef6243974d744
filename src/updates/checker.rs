//! Update feeds: fetch a check URL and extract the advertised release.
//!
//! A feed body is either JSON (`version` / `latest_version` / `tag_name`, an
//! optional download URL and SHA-256) or plain text, in which case the first
//! semantic-version token wins. An advertised checksum that is not a SHA-256
//! digest rejects the whole response.

#![allow(missing_docs)]

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::catalog::entry::is_sha256_hex;
use crate::core::errors::{DeployError, Result};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::download::CurlFetcher;
use crate::updates::state::FeedRelease;

static SEMVER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9A-Za-z.])[vV]?(\d+\.\d+(?:\.\d+){0,2}(?:-[0-9A-Za-z][0-9A-Za-z.]*)?)").ok()
});

const VERSION_KEYS: [&str; 3] = ["version", "latest_version", "tag_name"];
const URL_KEYS: [&str; 3] = ["download_url", "downloadUrl", "url"];
const CHECKSUM_KEYS: [&str; 3] = ["sha256", "checksum", "sha256sum"];

/// Source of update-feed bodies.
pub trait UpdateFeed: Send + Sync {
    fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String>;
}

impl UpdateFeed for CurlFetcher {
    fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        self.fetch_text(url, cancel)
    }
}

fn string_field(object: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn feed_error(details: String) -> DeployError {
    DeployError::Serialization {
        context: "update feed",
        details,
    }
}

/// Bare or `sha256:`-prefixed hex digest, optionally followed by a file name.
fn normalize_checksum(raw: &str) -> Result<String> {
    let lower = raw.trim().to_ascii_lowercase();
    let token = lower.split_whitespace().next().unwrap_or_default();
    let digest = token.strip_prefix("sha256:").unwrap_or(token);
    if is_sha256_hex(digest) {
        Ok(digest.to_string())
    } else {
        Err(feed_error(format!(
            "unsupported checksum {raw:?}: expected a SHA-256 hex digest"
        )))
    }
}

fn from_json(value: &Value) -> Result<Option<FeedRelease>> {
    let object = match value {
        Value::Object(object) => object,
        // Release lists are newest first.
        Value::Array(items) => {
            for item in items {
                if let Some(release) = from_json(item)? {
                    return Ok(Some(release));
                }
            }
            return Ok(None);
        }
        _ => return Ok(None),
    };
    let Some(version) = string_field(object, &VERSION_KEYS) else {
        return Ok(None);
    };
    let version = version
        .strip_prefix(['v', 'V'])
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        .map_or_else(|| version.clone(), str::to_string);

    let asset_url = object
        .get("assets")
        .and_then(Value::as_array)
        .and_then(|assets| {
            assets.iter().find_map(|asset| {
                asset
                    .get("browser_download_url")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
        });
    let download_url = string_field(object, &URL_KEYS[..2])
        .or(asset_url)
        .or_else(|| string_field(object, &URL_KEYS[2..]));
    let checksum = string_field(object, &CHECKSUM_KEYS)
        .map(|raw| normalize_checksum(&raw))
        .transpose()?;

    Ok(Some(FeedRelease {
        version,
        download_url,
        checksum,
    }))
}

/// Extract the advertised release from a feed body.
pub fn extract_release(body: &str) -> Result<FeedRelease> {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && let Some(release) = from_json(&value)?
    {
        return Ok(release);
    }
    SEMVER
        .as_ref()
        .and_then(|regex| regex.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map(|m| FeedRelease {
            version: m.as_str().to_string(),
            download_url: None,
            checksum: None,
        })
        .ok_or_else(|| feed_error("no version found in feed response".to_string()))
}
