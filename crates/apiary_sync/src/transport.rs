//! Size-aware delivery of server messages over a push channel.
//!
//! Every frame pushed to a connection is an [`Envelope`]. Messages that fit
//! within the push channel's frame limit travel inline; larger ones are
//! uploaded to blob storage and replaced by a download request the receiver
//! resolves over HTTP.

use crate::error::{Result, SyncError};
use crate::messenger::Messenger;
use crate::protocol::ServerMessage;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Largest payload, in characters, pushed inline.
///
/// Leaves headroom under the 128 KiB frame limit of typical push gateways.
pub const MAX_MESSAGE_SIZE: usize = 128_000;

/// Frame format used in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// The serialized message itself.
    Message { data: String },
    /// The serialized message was uploaded; fetch it from `url`.
    DownloadRequest { url: String },
}

/// Failure to push a frame to a single connection.
#[derive(Debug, Error)]
pub enum PushError {
    /// The connection no longer exists on the transport.
    #[error("Connection {0} is gone")]
    Gone(String),

    #[error("Push failed: {0}")]
    Failed(String),
}

/// Transport that can push a text frame to a connection by ID.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn post_to_connection(
        &self,
        connection_id: &str,
        data: &str,
    ) -> std::result::Result<(), PushError>;
}

/// Blob storage for payloads too large to push inline.
#[async_trait]
pub trait PayloadUploader: Send + Sync {
    /// Store `data` and return a URL from which it can be downloaded.
    async fn upload_message(&self, data: &str) -> Result<String>;
}

/// Resolves download requests.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Fetches offloaded payloads with a plain HTTP GET.
pub struct HttpPayloadFetcher {
    client: reqwest::Client,
}

impl HttpPayloadFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPayloadFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Download(format!("GET {} failed: {}", url, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!("Download request {} failed: {}", url, status);
            return Err(SyncError::Download(format!("GET {} returned {}", url, status)));
        }
        resp.text()
            .await
            .map_err(|e| SyncError::Download(format!("Failed to read body of {}: {}", url, e)))
    }
}

/// Unwrap a received frame, following download requests through `fetcher`.
pub async fn open_envelope(frame: &str, fetcher: &dyn PayloadFetcher) -> Result<String> {
    match serde_json::from_str::<Envelope>(frame)? {
        Envelope::Message { data } => Ok(data),
        Envelope::DownloadRequest { url } => {
            debug!("Resolving download request {}", url);
            fetcher.fetch(&url).await
        }
    }
}

/// [`Messenger`] that pushes envelopes through a [`PushChannel`], offloading
/// oversized messages through a [`PayloadUploader`].
///
/// Connections the channel reports as gone are returned to the caller
/// instead of failing the send.
pub struct OffloadMessenger {
    channel: Arc<dyn PushChannel>,
    uploader: Arc<dyn PayloadUploader>,
    max_message_size: usize,
}

impl OffloadMessenger {
    pub fn new(channel: Arc<dyn PushChannel>, uploader: Arc<dyn PayloadUploader>) -> Self {
        Self {
            channel,
            uploader,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Wrap serialized data in the envelope it should travel in.
    ///
    /// Size is measured in characters, not bytes.
    pub async fn envelope_for(&self, data: String) -> Result<Envelope> {
        let size = data.chars().count();
        if size <= self.max_message_size {
            return Ok(Envelope::Message { data });
        }
        info!(
            "Message of {} characters exceeds {}, offloading to blob storage",
            size, self.max_message_size
        );
        let url = self.uploader.upload_message(&data).await?;
        Ok(Envelope::DownloadRequest { url })
    }

    /// Push already-serialized data to every connection except `exclude`.
    ///
    /// All pushes are attempted. Returns the gone connections, or the first
    /// other failure once every push has finished.
    pub async fn send_raw(
        &self,
        connection_ids: &[String],
        data: String,
        exclude: Option<&str>,
    ) -> Result<Vec<String>> {
        let targets: Vec<&str> = connection_ids
            .iter()
            .map(String::as_str)
            .filter(|id| Some(*id) != exclude)
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let frame = serde_json::to_string(&self.envelope_for(data).await?)?;
        let frame = frame.as_str();
        let results = join_all(targets.into_iter().map(|id| async move {
            (id, self.channel.post_to_connection(id, frame).await)
        }))
        .await;

        let mut gone = Vec::new();
        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(()) => {}
                Err(PushError::Gone(_)) => {
                    info!("Connection {} is gone", id);
                    gone.push(id.to_string());
                }
                Err(PushError::Failed(reason)) => {
                    warn!("Failed to push to {}: {}", id, reason);
                    first_error.get_or_insert(SyncError::Messenger(format!(
                        "Push to {} failed: {}",
                        id, reason
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(gone),
        }
    }
}

#[async_trait]
impl Messenger for OffloadMessenger {
    async fn send_message(
        &self,
        connection_ids: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<Vec<String>> {
        let data = serde_json::to_string(message)?;
        self.send_raw(connection_ids, data, exclude).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AtomsReceivedEvent;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        frames: Mutex<Vec<(String, String)>>,
        gone: HashSet<String>,
        broken: HashSet<String>,
    }

    impl RecordingChannel {
        fn frames_for(&self, id: &str) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| to == id)
                .map(|(_, frame)| frame.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PushChannel for RecordingChannel {
        async fn post_to_connection(
            &self,
            connection_id: &str,
            data: &str,
        ) -> std::result::Result<(), PushError> {
            if self.gone.contains(connection_id) {
                return Err(PushError::Gone(connection_id.to_string()));
            }
            if self.broken.contains(connection_id) {
                return Err(PushError::Failed("socket closed".to_string()));
            }
            self.frames
                .lock()
                .unwrap()
                .push((connection_id.to_string(), data.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryBlobs {
        blobs: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl PayloadUploader for MemoryBlobs {
        async fn upload_message(&self, data: &str) -> Result<String> {
            let mut blobs = self.blobs.lock().unwrap();
            let url = format!("memory://messages/{}", blobs.len());
            blobs.insert(url.clone(), data.to_string());
            Ok(url)
        }
    }

    #[async_trait]
    impl PayloadFetcher for MemoryBlobs {
        async fn fetch(&self, url: &str) -> Result<String> {
            self.blobs
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| SyncError::Download(format!("{} not found", url)))
        }
    }

    struct Harness {
        channel: Arc<RecordingChannel>,
        blobs: Arc<MemoryBlobs>,
        messenger: OffloadMessenger,
    }

    fn setup(channel: RecordingChannel, max_message_size: usize) -> Harness {
        let channel = Arc::new(channel);
        let blobs = Arc::new(MemoryBlobs::default());
        let messenger = OffloadMessenger::new(channel.clone(), blobs.clone())
            .with_max_message_size(max_message_size);
        Harness {
            channel,
            blobs,
            messenger,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_small_message_is_sent_inline() {
        let h = setup(RecordingChannel::default(), MAX_MESSAGE_SIZE);
        let message = ServerMessage::AtomsReceived(AtomsReceivedEvent {
            branch: "abc".to_string(),
            hashes: vec!["hash1".to_string()],
        });

        h.messenger
            .send_message(&ids(&["device1"]), &message, None)
            .await
            .unwrap();

        let frames = h.channel.frames_for("device1");
        assert_eq!(frames.len(), 1);
        let data = open_envelope(&frames[0], h.blobs.as_ref()).await.unwrap();
        assert_eq!(serde_json::from_str::<ServerMessage>(&data).unwrap(), message);
        assert!(h.blobs.blobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_size_boundary() {
        let h = setup(RecordingChannel::default(), 10);

        let at_limit = h.messenger.envelope_for("a".repeat(10)).await.unwrap();
        assert_eq!(
            at_limit,
            Envelope::Message {
                data: "a".repeat(10)
            }
        );

        let over_limit = h.messenger.envelope_for("a".repeat(11)).await.unwrap();
        assert!(matches!(over_limit, Envelope::DownloadRequest { .. }));
    }

    #[tokio::test]
    async fn test_size_counts_characters_not_bytes() {
        let h = setup(RecordingChannel::default(), 4);

        // four characters, twelve bytes
        let envelope = h.messenger.envelope_for("日本語!".to_string()).await.unwrap();
        assert!(matches!(envelope, Envelope::Message { .. }));
    }

    #[tokio::test]
    async fn test_oversized_message_is_offloaded_once() {
        let h = setup(RecordingChannel::default(), 16);
        let data = "x".repeat(64);

        h.messenger
            .send_raw(&ids(&["device1", "device2"]), data.clone(), None)
            .await
            .unwrap();

        assert_eq!(h.blobs.blobs.lock().unwrap().len(), 1);
        for id in ["device1", "device2"] {
            let frames = h.channel.frames_for(id);
            assert_eq!(frames.len(), 1);
            let envelope: Envelope = serde_json::from_str(&frames[0]).unwrap();
            assert!(matches!(envelope, Envelope::DownloadRequest { .. }));
            assert_eq!(open_envelope(&frames[0], h.blobs.as_ref()).await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_excluded_connection_is_skipped() {
        let h = setup(RecordingChannel::default(), MAX_MESSAGE_SIZE);

        h.messenger
            .send_raw(&ids(&["device1", "device2"]), "{}".to_string(), Some("device1"))
            .await
            .unwrap();

        assert!(h.channel.frames_for("device1").is_empty());
        assert_eq!(h.channel.frames_for("device2").len(), 1);
    }

    #[tokio::test]
    async fn test_gone_connections_are_returned() {
        let channel = RecordingChannel {
            gone: HashSet::from(["device1".to_string()]),
            ..Default::default()
        };
        let h = setup(channel, MAX_MESSAGE_SIZE);

        let gone = h
            .messenger
            .send_raw(&ids(&["device1", "device2"]), "{}".to_string(), None)
            .await
            .unwrap();

        assert_eq!(gone, ids(&["device1"]));
        assert_eq!(h.channel.frames_for("device2").len(), 1);
    }

    #[tokio::test]
    async fn test_gone_connections_are_returned_for_offloaded_frames() {
        let channel = RecordingChannel {
            gone: HashSet::from(["device2".to_string()]),
            ..Default::default()
        };
        let h = setup(channel, 4);

        let gone = h
            .messenger
            .send_raw(&ids(&["device1", "device2"]), "x".repeat(32), None)
            .await
            .unwrap();

        assert_eq!(gone, ids(&["device2"]));
        assert_eq!(h.blobs.blobs.lock().unwrap().len(), 1);
        assert_eq!(h.channel.frames_for("device1").len(), 1);
    }

    #[tokio::test]
    async fn test_push_failure_is_reported_after_other_sends() {
        let channel = RecordingChannel {
            broken: HashSet::from(["device1".to_string()]),
            ..Default::default()
        };
        let h = setup(channel, MAX_MESSAGE_SIZE);

        let result = h
            .messenger
            .send_raw(&ids(&["device1", "device2"]), "{}".to_string(), None)
            .await;

        assert!(matches!(result, Err(SyncError::Messenger(_))));
        assert_eq!(h.channel.frames_for("device2").len(), 1);
    }

    #[tokio::test]
    async fn test_open_envelope_rejects_garbage() {
        let blobs = MemoryBlobs::default();
        assert!(open_envelope("not json", &blobs).await.is_err());
        assert!(
            open_envelope(r#"{"type":"download_request","url":"memory://missing"}"#, &blobs)
                .await
                .is_err()
        );
    }
}
