//! Chunked batch writes with retry of unprocessed items.
//!
//! Stores backed by batch APIs write at most [`BATCH_SIZE`] requests at a
//! time. Requests the backend reports as unprocessed are retried with
//! exponential backoff and dropped, with a warning, after [`MAX_RETRIES`].

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum number of requests per batch.
pub const BATCH_SIZE: usize = 25;

/// Retries per batch before unprocessed requests are dropped.
pub const MAX_RETRIES: u32 = 5;

/// Backoff before the first retry; doubles on every further retry.
pub const BASE_BACKOFF: Duration = Duration::from_micros(500);

/// Largest item a store accepts, in bytes.
pub const MAX_ITEM_SIZE: usize = 400 * 1024;

/// A backend that writes requests in batches.
#[async_trait]
pub trait BatchWriter<T: Send + 'static>: Send + Sync {
    /// Write one batch and return the requests that were not processed.
    async fn write_batch(&self, requests: Vec<T>) -> Result<Vec<T>>;
}

/// Write `requests` in chunks of [`BATCH_SIZE`], retrying unprocessed ones.
pub async fn process_batch<T, W>(writer: &W, requests: Vec<T>) -> Result<()>
where
    T: Send + 'static,
    W: BatchWriter<T> + ?Sized,
{
    let mut requests = requests.into_iter().peekable();
    while requests.peek().is_some() {
        let mut pending: Vec<T> = requests.by_ref().take(BATCH_SIZE).collect();
        let mut retries = 0;
        loop {
            pending = writer.write_batch(pending).await?;
            if pending.is_empty() {
                break;
            }
            if retries >= MAX_RETRIES {
                warn!(
                    "Dropping {} unprocessed requests after {} retries",
                    pending.len(),
                    retries
                );
                break;
            }
            let backoff = BASE_BACKOFF * 2u32.pow(retries);
            debug!(
                "{} requests unprocessed, retrying in {:?}",
                pending.len(),
                backoff
            );
            tokio::time::sleep(backoff).await;
            retries += 1;
        }
    }
    Ok(())
}

/// Reject items larger than [`MAX_ITEM_SIZE`].
pub fn check_item_size(key: &str, size: usize) -> Result<()> {
    if size > MAX_ITEM_SIZE {
        return Err(SyncError::ItemTooLarge {
            key: key.to_string(),
            size,
            limit: MAX_ITEM_SIZE,
        });
    }
    Ok(())
}
