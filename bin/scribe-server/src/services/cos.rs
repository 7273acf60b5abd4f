//! Tencent COS object storage collaborator.
//!
//! The pipeline depends only on the [`ObjectStorage`] trait; [`CosClient`] is
//! the production implementation, talking to the COS XML API over plain
//! reqwest with the v5 HMAC-SHA1 request signature. Tests inject an in-memory
//! fake instead.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{info, warn};

type HmacSha1 = Hmac<Sha1>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("local file not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upload failed after {attempts} attempts: {message}")]
    UploadFailed { attempts: u32, message: String },
}

/// Blob storage contract consumed by the pipeline engine.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Name of the bucket uploads land in.
    fn bucket(&self) -> &str;

    /// Upload a local file under `key`. Transient failures are retried a
    /// fixed number of times internally before the error is surfaced.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StorageError>;

    /// Time-limited, credential-free download URL for `key`.
    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Production COS client.
pub struct CosClient {
    http: reqwest::Client,
    secret_id: String,
    secret_key: String,
    bucket: String,
    region: String,
    upload_retries: u32,
}

impl CosClient {
    pub fn new(
        secret_id: impl Into<String>,
        secret_key: impl Into<String>,
        bucket: impl Into<String>,
        region: impl Into<String>,
        upload_retries: u32,
    ) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
            bucket: bucket.into(),
            region: region.into(),
            upload_retries: upload_retries.max(1),
        })
    }

    fn host(&self) -> String {
        format!("{}.cos.{}.myqcloud.com", self.bucket, self.region)
    }

    /// COS v5 signature over (method, path) for the `[start, end]` validity
    /// window. Header and URL-param lists are left empty, which COS accepts;
    /// the signature then covers only the verb and object path.
    fn sign(&self, method: &str, path: &str, start: i64, end: i64) -> String {
        let key_time = format!("{start};{end}");
        let sign_key = hmac_sha1_hex(self.secret_key.as_bytes(), key_time.as_bytes());
        let http_string = format!("{}\n{}\n\n\n", method.to_ascii_lowercase(), path);
        let string_to_sign = format!("sha1\n{key_time}\n{}\n", sha1_hex(http_string.as_bytes()));
        hmac_sha1_hex(sign_key.as_bytes(), string_to_sign.as_bytes())
    }

    fn auth_query(&self, method: &str, path: &str, ttl: Duration) -> String {
        let start = Utc::now().timestamp();
        let end = start + ttl.as_secs() as i64;
        let signature = self.sign(method, path, start, end);
        format!(
            "q-sign-algorithm=sha1&q-ak={}&q-sign-time={start};{end}&q-key-time={start};{end}\
             &q-header-list=&q-url-param-list=&q-signature={signature}",
            self.secret_id
        )
    }

    fn object_path(key: &str) -> String {
        // Keys are stored un-encoded; percent-encode for the request line.
        let mut path = String::from("/");
        for byte in key.as_bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                    path.push(*byte as char)
                }
                other => {
                    let _ = write!(path, "%{other:02X}");
                }
            }
        }
        path
    }
}

#[async_trait]
impl ObjectStorage for CosClient {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        if !local_path.exists() {
            return Err(StorageError::NotFound(local_path.display().to_string()));
        }
        let body = tokio::fs::read(local_path).await?;
        let path = Self::object_path(key);
        let url = format!(
            "https://{}{}?{}",
            self.host(),
            path,
            self.auth_query("put", &path, Duration::from_secs(600))
        );

        let mut last_error = String::new();
        for attempt in 1..=self.upload_retries {
            info!(key, attempt, total = self.upload_retries, "uploading object to COS");
            match self.http.put(&url).body(body.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(key, "object uploaded to COS");
                    return Ok(());
                }
                Ok(resp) => {
                    last_error = format!("COS responded with status {}", resp.status());
                    warn!(key, attempt, error = %last_error, "upload attempt failed");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(key, attempt, error = %last_error, "upload attempt failed");
                }
            }
        }
        Err(StorageError::UploadFailed {
            attempts: self.upload_retries,
            message: last_error,
        })
    }

    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let path = Self::object_path(key);
        let url = format!(
            "https://{}{}?{}",
            self.host(),
            path,
            self.auth_query("get", &path, ttl)
        );
        info!(key, ttl_secs = ttl.as_secs(), "generated presigned download URL");
        Ok(url)
    }
}

fn sha1_hex(data: &[u8]) -> String {
    hex(&Sha1::digest(data))
}

fn hmac_sha1_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    hex(&mac.finalize().into_bytes())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_path_percent_encodes_non_ascii_keys() {
        assert_eq!(CosClient::object_path("clips/take 1.aac"), "/clips/take%201.aac");
        assert_eq!(CosClient::object_path("a.wav"), "/a.wav");
    }

    #[test]
    fn hmac_sha1_matches_rfc2202_vector() {
        // RFC 2202 test case 2: key "Jefe", data "what do ya want for nothing?"
        assert_eq!(
            hmac_sha1_hex(b"Jefe", b"what do ya want for nothing?"),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }

    #[tokio::test]
    async fn presigned_url_carries_signature_params() {
        let client = CosClient::new("AKID", "secret", "recordings-125", "ap-guangzhou", 3).unwrap();
        let url = client
            .presign_download("clip.aac", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.starts_with("https://recordings-125.cos.ap-guangzhou.myqcloud.com/clip.aac?"));
        assert!(url.contains("q-sign-algorithm=sha1"));
        assert!(url.contains("q-ak=AKID"));
        assert!(url.contains("q-signature="));
    }

    #[tokio::test]
    async fn upload_of_missing_local_file_fails_without_network() {
        let client = CosClient::new("AKID", "secret", "b", "ap-guangzhou", 3).unwrap();
        let err = client
            .upload(Path::new("/nonexistent/audio.wav"), "audio.wav")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
