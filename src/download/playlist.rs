use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use crate::error::DownloadError;

/// Turns a signed playlist URL into the ordered list of absolute segment URLs.
#[async_trait]
pub trait PlaylistResolver: Send + Sync {
    async fn resolve(&self, playlist_url: &str) -> Result<Vec<String>, DownloadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playlist {
    /// Segment URIs in playback order.
    Media(Vec<String>),
    /// Variant playlist URIs in declaration order.
    Master(Vec<String>),
}

/// Parse an M3U8 document, resolving relative URIs against `base`.
pub fn parse_playlist(base: &Url, text: &str) -> Result<Playlist, String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some(first) if first.starts_with("#EXTM3U") => {}
        _ => return Err("not an M3U8 playlist (missing #EXTM3U header)".to_string()),
    }

    let mut segments = Vec::new();
    let mut variants = Vec::new();
    let mut expect_variant = false;

    for line in lines {
        if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            if !attrs.contains("METHOD=NONE") {
                return Err("encrypted playlists are not supported".to_string());
            }
            continue;
        }
        if line.starts_with("#EXT-X-STREAM-INF") {
            expect_variant = true;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let url = base
            .join(line)
            .map_err(|e| format!("invalid URI '{}': {}", line, e))?
            .to_string();
        if expect_variant {
            variants.push(url);
            expect_variant = false;
        } else {
            segments.push(url);
        }
    }

    if !variants.is_empty() {
        return Ok(Playlist::Master(variants));
    }
    if segments.is_empty() {
        return Err("playlist contains no segments".to_string());
    }
    Ok(Playlist::Media(segments))
}

pub struct HttpPlaylistResolver {
    client: Client,
}

impl HttpPlaylistResolver {
    /// How many master playlists we follow before giving up.
    const MAX_NESTING: usize = 2;

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &Url, origin: &str) -> Result<String, DownloadError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::playlist(origin, e.to_string()))?;

        if !response.status().is_success() {
            return Err(DownloadError::playlist(
                origin,
                format!("HTTP request failed with status: {}", response.status()),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| DownloadError::playlist(origin, e.to_string()))
    }
}

#[async_trait]
impl PlaylistResolver for HttpPlaylistResolver {
    async fn resolve(&self, playlist_url: &str) -> Result<Vec<String>, DownloadError> {
        let mut url = Url::parse(playlist_url)
            .map_err(|e| DownloadError::playlist(playlist_url, format!("invalid URL: {}", e)))?;

        for _ in 0..=Self::MAX_NESTING {
            let text = self.fetch(&url, playlist_url).await?;
            match parse_playlist(&url, &text)
                .map_err(|reason| DownloadError::playlist(playlist_url, reason))?
            {
                Playlist::Media(segments) => {
                    debug!("Playlist {} has {} segments", url, segments.len());
                    return Ok(segments);
                }
                Playlist::Master(variants) => {
                    // No quality selection: the first declared variant wins.
                    let first = &variants[0];
                    debug!("Following variant playlist {}", first);
                    url = Url::parse(first)
                        .map_err(|e| DownloadError::playlist(playlist_url, e.to_string()))?;
                }
            }
        }

        Err(DownloadError::playlist(
            playlist_url,
            "too many nested master playlists",
        ))
    }
}
