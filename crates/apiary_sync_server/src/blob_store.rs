use crate::config::{Config, S3Config};
use apiary_sync::error::{Result as SyncResult, SyncError};
use apiary_sync::transport::PayloadUploader;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{RequestChecksumCalculation, ResponseChecksumValidation};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_smithy_types::byte_stream::ByteStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// Storage for message payloads too large to push inline.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn message_key(&self, id: &str) -> String;

    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<(), String>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;

    /// URL from which a device can download the blob without credentials.
    async fn download_url(&self, key: &str) -> Result<String, String>;
}

fn prefixed_message_key(prefix: &str, id: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("messages/{}.json", id)
    } else {
        format!("{}/messages/{}.json", prefix, id)
    }
}

#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
    url_expiry: Duration,
}

impl S3BlobStore {
    pub async fn new(config: &S3Config, url_expiry: Duration) -> Result<Self, String> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.r2.cloudflarestorage.com", config.account_id));

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()))
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,
                None,
                "apiary-s3",
            ))
            .endpoint_url(endpoint)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            // R2 rejects the optional checksums newer SDK versions send by default.
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            url_expiry,
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn message_key(&self, id: &str) -> String {
        prefixed_message_key(&self.prefix, id)
    }

    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<(), String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(mime_type)
            .content_length(bytes.len() as i64)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| {
                let code = e.code().unwrap_or("unknown");
                let message = e.message().unwrap_or("unknown");
                format!(
                    "S3 put failed for bucket={} key={}: code={} message={}",
                    self.bucket, key, code, message
                )
            })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match response {
            Ok(out) => {
                let body = out
                    .body
                    .collect()
                    .await
                    .map_err(|e| format!("S3 get body failed for {}: {}", key, e))?;
                Ok(Some(body.into_bytes().to_vec()))
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("NoSuchKey") || msg.contains("404") || msg.contains("Not Found") {
                    Ok(None)
                } else {
                    let code = e.code().unwrap_or("unknown");
                    let message = e.message().unwrap_or("unknown");
                    Err(format!(
                        "S3 get failed for bucket={} key={}: code={} message={}",
                        self.bucket, key, code, message
                    ))
                }
            }
        }
    }

    async fn download_url(&self, key: &str) -> Result<String, String> {
        let presigning = PresigningConfig::expires_in(self.url_expiry)
            .map_err(|e| format!("Invalid presign expiry {:?}: {}", self.url_expiry, e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| format!("S3 presign failed for key={}: {}", key, e))?;
        Ok(request.uri().to_string())
    }
}

type StoredBlob = (Instant, Vec<u8>);

/// Blob store kept in process memory and served by the `/blobs` route.
///
/// Blobs live as long as their download URLs are meant to; expired ones are
/// hidden from `get` and dropped on the next `put`.
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    prefix: String,
    public_base_url: String,
    ttl: Duration,
}

impl InMemoryBlobStore {
    pub fn new(
        prefix: impl Into<String>,
        public_base_url: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            prefix: prefix.into(),
            public_base_url: public_base_url.into(),
            ttl,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StoredBlob>>, String> {
        self.blobs
            .lock()
            .map_err(|_| "Failed to lock in-memory blob store".to_string())
    }

    /// Number of blobs held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().map(|blobs| blobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    fn message_key(&self, id: &str) -> String {
        prefixed_message_key(&self.prefix, id)
    }

    async fn put(&self, key: &str, bytes: &[u8], _mime_type: &str) -> Result<(), String> {
        let now = Instant::now();
        let mut blobs = self.lock()?;
        let before = blobs.len();
        blobs.retain(|_, (stored, _)| now.duration_since(*stored) < self.ttl);
        if blobs.len() < before {
            debug!("Evicted {} expired blobs", before - blobs.len());
        }
        blobs.insert(key.to_string(), (now, bytes.to_vec()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self
            .lock()?
            .get(key)
            .filter(|(stored, _)| stored.elapsed() < self.ttl)
            .map(|(_, bytes)| bytes.clone()))
    }

    async fn download_url(&self, key: &str) -> Result<String, String> {
        Ok(format!(
            "{}/blobs/{}",
            self.public_base_url.trim_end_matches('/'),
            key
        ))
    }
}

pub async fn build_blob_store(config: &Config) -> Result<Arc<dyn BlobStore>, String> {
    let expiry = Duration::from_secs(config.blob_url_expiry_secs);
    if config.is_s3_configured() {
        let store = S3BlobStore::new(&config.s3, expiry).await?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(InMemoryBlobStore::new(
            config.s3.prefix.clone(),
            config.public_base_url.clone(),
            expiry,
        )))
    }
}

/// Uploads oversized messages to a [`BlobStore`] under a fresh key.
pub struct BlobUploader {
    store: Arc<dyn BlobStore>,
}

impl BlobUploader {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PayloadUploader for BlobUploader {
    async fn upload_message(&self, data: &str) -> SyncResult<String> {
        let key = self.store.message_key(&uuid::Uuid::new_v4().to_string());
        self.store
            .put(&key, data.as_bytes(), "application/json")
            .await
            .map_err(SyncError::Upload)?;
        debug!("Uploaded {} byte message to {}", data.len(), key);
        self.store.download_url(&key).await.map_err(SyncError::Upload)
    }
}
