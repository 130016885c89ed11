use std::env;
use std::path::PathBuf;

use apiary_sync::transport::MAX_MESSAGE_SIZE;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Database file path (default: ./apiary.db)
    pub database_path: PathBuf,
    /// Externally reachable base URL, used for in-memory blob download links
    pub public_base_url: String,
    /// Largest message, in characters, pushed inline (default: 128000)
    pub max_message_size: usize,
    /// Lifetime of presigned blob download URLs in seconds (default: 3600)
    pub blob_url_expiry_secs: u64,
    /// S3-compatible storage for offloaded messages
    pub s3: S3Config,
}

/// S3-compatible blob storage configuration.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Bucket name (default: apiary-messages)
    pub bucket: String,
    /// Cloudflare account ID, used to derive the R2 endpoint when no endpoint is given
    pub account_id: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Optional endpoint override
    pub endpoint: Option<String>,
    /// Region (default: auto)
    pub region: String,
    /// Object key prefix (default: apiary)
    pub prefix: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path =
            PathBuf::from(env::var("DATABASE_PATH").unwrap_or_else(|_| "./apiary.db".to_string()));

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port))
            .trim_end_matches('/')
            .to_string();

        let max_message_size = match env::var("MAX_MESSAGE_SIZE") {
            Ok(value) => value
                .parse::<usize>()
                .ok()
                .filter(|size| *size > 0)
                .ok_or(ConfigError::InvalidMaxMessageSize)?,
            Err(_) => MAX_MESSAGE_SIZE,
        };

        let blob_url_expiry_secs = env::var("BLOB_URL_EXPIRY_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3600);

        let s3 = S3Config {
            bucket: env::var("S3_BUCKET").unwrap_or_else(|_| "apiary-messages".to_string()),
            account_id: env::var("S3_ACCOUNT_ID").unwrap_or_default(),
            access_key_id: env::var("S3_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: env::var("S3_SECRET_ACCESS_KEY").unwrap_or_default(),
            endpoint: env::var("S3_ENDPOINT")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            region: env::var("S3_REGION").unwrap_or_else(|_| "auto".to_string()),
            prefix: env::var("S3_PREFIX").unwrap_or_else(|_| "apiary".to_string()),
        };

        Ok(Config {
            host,
            port,
            database_path,
            public_base_url,
            max_message_size,
            blob_url_expiry_secs,
            s3,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if S3 credentials and an endpoint (or account ID) are configured.
    pub fn is_s3_configured(&self) -> bool {
        (self.s3.endpoint.is_some() || !self.s3.account_id.is_empty())
            && !self.s3.access_key_id.is_empty()
            && !self.s3.secret_access_key.is_empty()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidMaxMessageSize,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidMaxMessageSize => {
                write!(f, "Invalid MAX_MESSAGE_SIZE environment variable")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
