use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::part_path_for;
use super::retry::{RetryDecision, RetryPolicy, SegmentFailure, classify};
use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes: u64,
    pub attempts: u32,
    /// The segment was already on disk from an earlier run.
    pub reused: bool,
}

/// Fetches single segments with retry and atomic writes.
pub struct SegmentFetcher {
    client: Client,
    policy: RetryPolicy,
}

impl SegmentFetcher {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn build_client(timeout: Duration) -> Result<Client> {
        Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lecture-dl/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Download `url` to `dest`. `on_retry(attempt, delay)` fires before each backoff sleep.
    pub async fn fetch<F>(
        &self,
        url: &str,
        dest: &Path,
        index: usize,
        on_retry: F,
    ) -> Result<FetchOutcome, DownloadError>
    where
        F: Fn(u32, Duration) + Send + Sync,
    {
        if let Ok(metadata) = fs::metadata(dest).await {
            if metadata.is_file() {
                debug!("Segment {} already present at {:?}", index, dest);
                return Ok(FetchOutcome {
                    bytes: metadata.len(),
                    attempts: 0,
                    reused: true,
                });
            }
        }

        let mut attempt = 1u32;
        loop {
            match self.attempt(url, dest).await {
                Ok(bytes) => {
                    return Ok(FetchOutcome {
                        bytes,
                        attempts: attempt,
                        reused: false,
                    });
                }
                Err(failure) => match self.policy.decide(attempt, classify(&failure)) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            "[Retry {}/{}] Failed to download segment {}: {}",
                            attempt, self.policy.max_attempts, index, failure
                        );
                        on_retry(attempt, delay);
                        sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::NoRetry => {
                        return Err(DownloadError::SegmentFetch {
                            index,
                            attempts: attempt,
                            reason: failure.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// One GET, streamed into `<dest>.part` and renamed on success.
    async fn attempt(&self, url: &str, dest: &Path) -> Result<u64, SegmentFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(SegmentFailure::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SegmentFailure::Http(status.as_u16()));
        }

        let part = part_path_for(dest);
        let mut file = File::create(&part).await.map_err(SegmentFailure::Storage)?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&part).await;
                    return Err(SegmentFailure::Transport(e));
                }
            };
            file.write_all(&chunk).await.map_err(SegmentFailure::Storage)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(SegmentFailure::Storage)?;
        drop(file);
        fs::rename(&part, dest).await.map_err(SegmentFailure::Storage)?;
        Ok(written)
    }
}
