//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

/// Runtime configuration for scribe-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set, except the Tencent Cloud
/// credentials, which default to empty strings and make the remote clients
/// fail loudly on first use.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite (or other) database URL (default: `"sqlite://scribe.db"`).
    /// Supports any sqlx-compatible connection string.
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated CORS origin allow-list; `None` means wildcard.
    pub cors_allowed_origins: Option<String>,

    /// ffmpeg binary used for audio extraction (default: `"ffmpeg"` on PATH).
    pub ffmpeg_path: String,

    /// Tencent Cloud API credentials (shared by COS and ASR).
    pub secret_id: String,
    pub secret_key: String,

    /// COS bucket name, e.g. `"recordings-1250000000"`.
    pub cos_bucket: String,
    /// COS region, e.g. `"ap-guangzhou"`.
    pub cos_region: String,
    /// Upload retry attempts before the upload is reported as failed.
    pub cos_upload_retries: u32,
    /// Presigned download URL validity. Must comfortably exceed the expected
    /// ASR processing time; one hour by default.
    pub presign_ttl: Duration,

    /// ASR API region, e.g. `"ap-guangzhou"`.
    pub asr_region: String,
    /// Total time to wait for a remote ASR task before giving up.
    pub asr_poll_timeout: Duration,
    /// Sleep between consecutive status polls.
    pub asr_poll_interval: Duration,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("SCRIBE_BIND", "0.0.0.0:3000"),
            database_url: env_or("SCRIBE_DATABASE_URL", "sqlite://scribe.db"),
            log_level: env_or("SCRIBE_LOG", "info"),
            log_json: std::env::var("SCRIBE_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: std::env::var("SCRIBE_CORS_ORIGINS").ok(),
            ffmpeg_path: env_or("SCRIBE_FFMPEG", "ffmpeg"),
            secret_id: env_or("TENCENTCLOUD_SECRET_ID", ""),
            secret_key: env_or("TENCENTCLOUD_SECRET_KEY", ""),
            cos_bucket: env_or("SCRIBE_COS_BUCKET", ""),
            cos_region: env_or("SCRIBE_COS_REGION", "ap-guangzhou"),
            cos_upload_retries: parse_env("SCRIBE_COS_UPLOAD_RETRIES", 3),
            presign_ttl: Duration::from_secs(parse_env("SCRIBE_PRESIGN_TTL_SECS", 3600)),
            asr_region: env_or("SCRIBE_ASR_REGION", "ap-guangzhou"),
            asr_poll_timeout: Duration::from_secs(parse_env("SCRIBE_ASR_POLL_TIMEOUT_SECS", 600)),
            asr_poll_interval: Duration::from_secs(parse_env("SCRIBE_ASR_POLL_INTERVAL_SECS", 5)),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
