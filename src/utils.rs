//! Utility functions for reading proxy lists.

use std::path::PathBuf;

use reqwest::Client;

use crate::error::SourceError;

/// Fetch and parse a list of proxies from a URL or file path.
pub(crate) async fn fetch_proxies_from_source(
    client: &Client,
    source: &str,
    default_scheme: &str,
) -> Result<Vec<String>, SourceError> {
    let content = if source.starts_with("http") {
        client
            .get(source)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?
    } else {
        tokio::fs::read_to_string(source)
            .await
            .map_err(|source_err| SourceError::Io {
                path: PathBuf::from(source),
                source: source_err,
            })?
    };
    Ok(parse_proxy_list(&content, default_scheme))
}

/// Parse one proxy per line. Bare `host:port` lines get `default_scheme`.
pub(crate) fn parse_proxy_list(content: &str, default_scheme: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                None
            } else if line.contains("://") {
                Some(line.to_string())
            } else if line.contains(':') {
                Some(format!("{}://{}", default_scheme, line))
            } else {
                None
            }
        })
        .collect()
}
