//! Remote code box client over HTTP
//!
//! Talks to a code box REST service. Every context lives under
//! `{base_url}/codebox/{id}`:
//!
//! ```text
//! POST /codebox/start                  -> {"id": "..."}
//! POST /codebox/{id}/exec              {"code"} -> {"type", "content", "files"}
//! POST /codebox/{id}/upload            {"file_name", "content": base64}
//! GET  /codebox/{id}/download?file_name=...  -> {"file_name", "content": base64}
//! POST /codebox/{id}/install           {"package_name"}
//! GET  /codebox/{id}/status            -> {"status": "running"}
//! POST /codebox/{id}/stop
//! ```
//!
//! Execution output `type` is `"text"`, `"error"` or an image MIME type such
//! as `"image/png"` (with base64 `content`).

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CodeBox, CodeBoxOutput, CodeBoxStatus, SessionHandle};
use crate::classifier::generated_name;
use crate::error::CodeBoxError;
use crate::types::Artifact;

#[derive(Debug, Deserialize)]
struct StartResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    code: &'a str,
}

/// Wire format of one execution output
#[derive(Debug, Clone, Deserialize)]
pub struct ExecResponse {
    #[serde(rename = "type")]
    pub output_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    file_name: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    content: String,
}

#[derive(Debug, Serialize)]
struct InstallRequest<'a> {
    package_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

/// Client for a remote code box service
#[derive(Clone)]
pub struct HttpCodeBox {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    /// Attempts made by `open` before reporting the service unavailable
    open_retries: u32,
    /// Delay between `open` attempts
    retry_delay: Duration,
}

impl HttpCodeBox {
    /// Create a client for the service at `base_url`
    ///
    /// # Arguments
    /// * `base_url` - Service root (e.g., "https://codebox.example.com/v1")
    /// * `api_key` - Optional bearer token
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
            open_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Configure retry behaviour for context allocation
    pub fn with_open_retries(mut self, retries: u32, delay_ms: u64) -> Self {
        self.open_retries = retries.max(1);
        self.retry_delay = Duration::from_millis(delay_ms);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn context_url(&self, handle: &SessionHandle, action: &str) -> String {
        self.url(&format!("/codebox/{}/{}", handle.id, action))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Send a request, mapping failures onto the code box error taxonomy
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CodeBoxError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| CodeBoxError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(error_for_status(status, &body))
    }

    async fn open_once(&self) -> Result<SessionHandle, CodeBoxError> {
        let response = self.send(self.client.post(self.url("/codebox/start"))).await?;
        let start: StartResponse = response
            .json()
            .await
            .map_err(|e| CodeBoxError::Unavailable(format!("invalid start response: {}", e)))?;
        Ok(SessionHandle::new(start.id))
    }
}

/// Map a non-success HTTP status to a code box error
pub fn error_for_status(status: StatusCode, body: &str) -> CodeBoxError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };
    match status {
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
            CodeBoxError::Unavailable(detail)
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            CodeBoxError::Transport(format!("context no longer exists ({})", detail))
        }
        s if s.is_server_error() => CodeBoxError::Transport(detail),
        _ => CodeBoxError::Rejected(detail),
    }
}

/// Convert a wire execution response into backend output
pub fn output_from_response(response: ExecResponse) -> Result<CodeBoxOutput, CodeBoxError> {
    let mut output = match response.output_type.as_str() {
        "error" => CodeBoxOutput::error(response.content),
        t if t.starts_with("image/") => {
            let bytes = BASE64
                .decode(response.content.trim())
                .map_err(|e| CodeBoxError::Rejected(format!("invalid image payload: {}", e)))?;
            CodeBoxOutput::text("").with_artifact(Artifact::with_content_type(
                generated_name(t),
                t,
                bytes,
            ))
        }
        _ => CodeBoxOutput::text(response.content),
    };
    output.produced_files = response.files;
    Ok(output)
}

#[async_trait]
impl CodeBox for HttpCodeBox {
    async fn open(&self) -> Result<SessionHandle, CodeBoxError> {
        let mut last_error = None;

        for attempt in 0..self.open_retries {
            match self.open_once().await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Code box start attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < self.open_retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(CodeBoxError::Unavailable(msg)) | Some(CodeBoxError::Transport(msg)) => {
                CodeBoxError::Unavailable(msg)
            }
            Some(other) => other,
            None => CodeBoxError::Unavailable("max retries reached".to_string()),
        })
    }

    async fn execute(
        &self,
        handle: &SessionHandle,
        code: &str,
    ) -> Result<CodeBoxOutput, CodeBoxError> {
        let request = self
            .client
            .post(self.context_url(handle, "exec"))
            .json(&ExecRequest { code });
        let response: ExecResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| CodeBoxError::Transport(format!("invalid exec response: {}", e)))?;

        debug!(session_id = %handle.id, output_type = %response.output_type, "Code box responded");
        output_from_response(response)
    }

    async fn upload(
        &self,
        handle: &SessionHandle,
        name: &str,
        content: &[u8],
    ) -> Result<(), CodeBoxError> {
        let request = self
            .client
            .post(self.context_url(handle, "upload"))
            .json(&UploadRequest {
                file_name: name,
                content: BASE64.encode(content),
            });
        self.send(request).await?;
        Ok(())
    }

    async fn download(&self, handle: &SessionHandle, name: &str) -> Result<Vec<u8>, CodeBoxError> {
        let request = self
            .client
            .get(self.context_url(handle, "download"))
            .query(&[("file_name", name)]);
        let response: DownloadResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| CodeBoxError::Rejected(format!("invalid download response: {}", e)))?;
        BASE64
            .decode(response.content.trim())
            .map_err(|e| CodeBoxError::Rejected(format!("invalid file payload: {}", e)))
    }

    async fn install(&self, handle: &SessionHandle, package: &str) -> Result<(), CodeBoxError> {
        let request = self
            .client
            .post(self.context_url(handle, "install"))
            .json(&InstallRequest {
                package_name: package,
            });
        self.send(request).await?;
        Ok(())
    }

    async fn status(&self, handle: &SessionHandle) -> Result<CodeBoxStatus, CodeBoxError> {
        let response: StatusResponse = self
            .send(self.client.get(self.context_url(handle, "status")))
            .await?
            .json()
            .await
            .map_err(|e| CodeBoxError::Transport(format!("invalid status response: {}", e)))?;
        Ok(match response.status.as_str() {
            "running" => CodeBoxStatus::Running,
            "stopped" | "exited" => CodeBoxStatus::Stopped,
            _ => CodeBoxStatus::Unknown,
        })
    }

    async fn close(&self, handle: &SessionHandle) -> Result<(), CodeBoxError> {
        self.send(self.client.post(self.context_url(handle, "stop")))
            .await?;
        Ok(())
    }
}
