//! Tencent Cloud ASR collaborator.
//!
//! The pipeline depends only on the [`SpeechRecognizer`] trait; the
//! production implementation speaks the `CreateRecTask` /
//! `DescribeTaskStatus` JSON API (version 2019-06-14) with TC3-HMAC-SHA256
//! request signing. Remote status codes: 0 = waiting, 1 = in progress,
//! 2 = success, 3 = failed.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

const ASR_HOST: &str = "asr.tencentcloudapi.com";
const ASR_VERSION: &str = "2019-06-14";
const ASR_SERVICE: &str = "asr";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("asr api error {code}: {message}")]
    Api { code: String, message: String },

    #[error("malformed asr response: {0}")]
    Malformed(String),
}

/// Engine parameters shared by every task of one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrTaskParams {
    /// Engine model, e.g. `"16k_zh_large"`.
    pub engine_model_type: String,
    pub channel_num: i64,
    /// 0 = plain text, 1 = word-level detail.
    pub res_text_format: i64,
}

impl Default for AsrTaskParams {
    fn default() -> Self {
        Self {
            engine_model_type: "16k_zh_large".to_owned(),
            channel_num: 1,
            res_text_format: 0,
        }
    }
}

/// One observation of a remote task's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTaskState {
    Pending,
    Processing,
    Success { result: String },
    Failed { error: String },
}

/// Remote transcription contract consumed by the pipeline engine.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Create a recognition task for a downloadable source URL; returns the
    /// remote engine's task handle.
    async fn create_task(&self, params: &AsrTaskParams, source_url: &str) -> Result<i64, AsrError>;

    /// One status poll. Transport errors are surfaced; the caller decides
    /// whether to retry.
    async fn poll_status(&self, remote_task_id: i64) -> Result<RemoteTaskState, AsrError>;
}

/// Production Tencent Cloud ASR client.
pub struct TencentAsrClient {
    http: reqwest::Client,
    secret_id: String,
    secret_key: String,
    region: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateRecTaskRequest<'a> {
    engine_model_type: &'a str,
    channel_num: i64,
    res_text_format: i64,
    /// 0 = fetch the audio from `Url`.
    source_type: i64,
    url: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTaskStatusRequest {
    task_id: i64,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    #[serde(rename = "Response")]
    response: ApiResponse<T>,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "Data")]
    data: Option<T>,
    #[serde(rename = "Error")]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Deserialize)]
struct CreatedTask {
    #[serde(rename = "TaskId")]
    task_id: i64,
}

#[derive(Deserialize)]
struct TaskStatusData {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "Result")]
    result: Option<String>,
    #[serde(rename = "ErrorMsg")]
    error_msg: Option<String>,
}

impl TencentAsrClient {
    pub fn new(
        secret_id: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Result<Self, AsrError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
            region: region.into(),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
        payload: &str,
    ) -> Result<T, AsrError> {
        let timestamp = Utc::now().timestamp();
        let authorization = self.authorization(payload, timestamp);

        let envelope: ApiEnvelope<T> = self
            .http
            .post(format!("https://{ASR_HOST}/"))
            .header("Authorization", authorization)
            .header("Content-Type", "application/json")
            .header("Host", ASR_HOST)
            .header("X-TC-Action", action)
            .header("X-TC-Version", ASR_VERSION)
            .header("X-TC-Region", &self.region)
            .header("X-TC-Timestamp", timestamp.to_string())
            .body(payload.to_owned())
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = envelope.response.error {
            return Err(AsrError::Api {
                code: err.code,
                message: err.message,
            });
        }
        envelope
            .response
            .data
            .ok_or_else(|| AsrError::Malformed(format!("{action} returned neither Data nor Error")))
    }

    /// TC3-HMAC-SHA256 request signature, as specified by the Tencent Cloud
    /// API v3 signing process.
    fn authorization(&self, payload: &str, timestamp: i64) -> String {
        let date = chrono::DateTime::from_timestamp(timestamp, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let canonical_request = format!(
            "POST\n/\n\ncontent-type:application/json\nhost:{ASR_HOST}\n\ncontent-type;host\n{}",
            sha256_hex(payload.as_bytes())
        );
        let credential_scope = format!("{date}/{ASR_SERVICE}/tc3_request");
        let string_to_sign = format!(
            "TC3-HMAC-SHA256\n{timestamp}\n{credential_scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let secret_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), date.as_bytes());
        let secret_service = hmac_sha256(&secret_date, ASR_SERVICE.as_bytes());
        let secret_signing = hmac_sha256(&secret_service, b"tc3_request");
        let signature = hex(&hmac_sha256(&secret_signing, string_to_sign.as_bytes()));

        format!(
            "TC3-HMAC-SHA256 Credential={}/{credential_scope}, \
             SignedHeaders=content-type;host, Signature={signature}",
            self.secret_id
        )
    }
}

#[async_trait]
impl SpeechRecognizer for TencentAsrClient {
    async fn create_task(&self, params: &AsrTaskParams, source_url: &str) -> Result<i64, AsrError> {
        let request = CreateRecTaskRequest {
            engine_model_type: &params.engine_model_type,
            channel_num: params.channel_num,
            res_text_format: params.res_text_format,
            source_type: 0,
            url: source_url,
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| AsrError::Malformed(e.to_string()))?;
        let created: CreatedTask = self.call("CreateRecTask", &payload).await?;
        info!(asr_task_id = created.task_id, "remote recognition task created");
        Ok(created.task_id)
    }

    async fn poll_status(&self, remote_task_id: i64) -> Result<RemoteTaskState, AsrError> {
        let payload = serde_json::to_string(&DescribeTaskStatusRequest {
            task_id: remote_task_id,
        })
        .map_err(|e| AsrError::Malformed(e.to_string()))?;
        let data: TaskStatusData = self.call("DescribeTaskStatus", &payload).await?;
        debug!(asr_task_id = remote_task_id, status = data.status, "asr status polled");
        Ok(match data.status {
            0 => RemoteTaskState::Pending,
            1 => RemoteTaskState::Processing,
            2 => RemoteTaskState::Success {
                result: data.result.unwrap_or_default(),
            },
            3 => RemoteTaskState::Failed {
                error: data
                    .error_msg
                    .unwrap_or_else(|| "remote engine reported failure".to_owned()),
            },
            other => {
                return Err(AsrError::Malformed(format!(
                    "unknown remote status code {other}"
                )))
            }
        })
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────
