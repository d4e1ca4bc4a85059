//! Subscription fetching and link merging

use std::collections::HashSet;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use tracing::debug;

use crate::error::{PoolError, Result};

/// Request timeout for subscription downloads
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Download one subscription and split it into links
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Vec<String>> {
    let failed = |reason: String| PoolError::Subscription {
        url: url.to_string(),
        reason,
    };

    let body = client
        .get(url)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|e| failed(e.to_string()))?
        .text()
        .await
        .map_err(|e| failed(e.to_string()))?;

    let links = split_links(&body);
    debug!(url, count = links.len(), "Fetched subscription");
    Ok(links)
}

/// One link per non-empty line
///
/// Bodies that carry no scheme separator are tried as base64 first, which is
/// how most providers publish their lists.
pub fn split_links(body: &str) -> Vec<String> {
    let decoded = decode_body(body);
    decoded
        .as_deref()
        .unwrap_or(body)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

fn decode_body(body: &str) -> Option<String> {
    if body.contains("://") {
        return None;
    }
    let compact: String = body.split_whitespace().collect();
    if compact.is_empty() {
        return None;
    }

    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .filter_map(|engine| engine.decode(compact.as_bytes()).ok())
        .filter_map(|bytes| String::from_utf8(bytes).ok())
        .find(|text| text.contains("://"))
}

/// Union of several link lists
///
/// Keeps the first occurrence of each link in input order; literal
/// duplicates within and across lists collapse to one entry.
pub fn merge_links<I, L, S>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = L>,
    L: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for list in lists {
        for link in list {
            let link = link.as_ref().trim();
            if !link.is_empty() && seen.insert(link.to_string()) {
                merged.push(link.to_string());
            }
        }
    }
    merged
}
