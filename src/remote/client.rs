use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use crate::config::RemoteConfig;
use crate::core::{
    ChunkAck,
    InitRequest,
    ProgressCallback,
    RemoteUpload,
    Result,
    UploadError,
    UploadId,
    UploadService,
    UploadSession,
};
use super::progress_stream::chunk_stream;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    message: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    completed: bool,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    missing_chunks: Vec<u64>,
    message: Option<String>,
}

/// Whether a server message reports that chunk assembly failed.
pub fn is_finalization_failure(message: &str) -> bool {
    message.to_ascii_lowercase().contains("finalization failed")
}

/// `UploadService` over the `/upload/chunked/*` HTTP API.
#[derive(Debug, Clone)]
pub struct HttpUploadService {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpUploadService {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .tcp_nodelay(true)
            .build()?;

        let mut endpoint = config.endpoint.clone();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }

        Ok(Self {
            client,
            base: Url::parse(&endpoint)?,
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|err| UploadError::InitializationFailed(format!("Invalid token: {}", err)))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Rejects unauthorized responses and other non-success statuses.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UploadError::AuthenticationRequired);
        }
        if status.is_success() {
            return Ok(response);
        }

        let message = error_message(response).await;
        Err(UploadError::server_error(status.as_u16(), message))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn ack(&self, request: reqwest::RequestBuilder) -> Result<()> {
        let response = request.headers(self.headers()?).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    serde_json::from_str::<ApiResponse<serde_json::Value>>(&text)
        .ok()
        .and_then(|body| body.message.or(body.error))
        .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text })
}

#[async_trait]
impl UploadService for HttpUploadService {
    async fn init(&self, request: &InitRequest) -> Result<UploadSession> {
        let response = self
            .client
            .post(self.url("upload/chunked/init")?)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await?;

        let response = Self::check(response).await.map_err(|err| match err {
            UploadError::AuthenticationRequired => err,
            UploadError::ServerError { message, .. } => UploadError::InitializationFailed(message),
            other => UploadError::InitializationFailed(other.to_string()),
        })?;

        let body: ApiResponse<UploadSession> = Self::json(response).await?;
        match body.data {
            Some(session) if body.success => Ok(session),
            _ => Err(UploadError::InitializationFailed(
                body.message.or(body.error).unwrap_or_else(|| "Server rejected upload".to_string()),
            )),
        }
    }

    async fn upload_chunk(
        &self,
        upload_id: &UploadId,
        chunk_index: u64,
        data: Bytes,
        progress: ProgressCallback,
    ) -> Result<ChunkAck> {
        let length = data.len() as u64;
        let body = reqwest::Body::wrap_stream(chunk_stream(data, progress));
        let part = Part::stream_with_length(body, length)
            .file_name(format!("chunk-{}", chunk_index))
            .mime_str(mime::APPLICATION_OCTET_STREAM.as_ref())?;
        let form = Form::new()
            .text("chunkIndex", chunk_index.to_string())
            .part("chunk", part);

        debug!(upload_id = %upload_id, chunk_index, length, "Sending chunk");

        let response = self
            .client
            .post(self.url(&format!("upload/chunked/chunk/{}", upload_id))?)
            .headers(self.headers()?)
            .multipart(form)
            .send()
            .await
            .map_err(|err| UploadError::TransferFailed(err.to_string()))?;

        let response = Self::check(response).await.map_err(|err| match err {
            UploadError::ServerError { message, .. } if is_finalization_failure(&message) => {
                UploadError::FinalizationFailed(message)
            }
            UploadError::ServerError { status_code, message } => {
                UploadError::TransferFailed(format!("status {}: {}", status_code, message))
            }
            other => other,
        })?;

        let body: ChunkResponse = Self::json(response).await?;
        if !body.success {
            let message = body.message.unwrap_or_else(|| format!("Chunk {} rejected", chunk_index));
            return Err(if is_finalization_failure(&message) {
                UploadError::FinalizationFailed(message)
            } else {
                UploadError::TransferFailed(message)
            });
        }

        Ok(ChunkAck { completed: body.completed })
    }

    async fn pause(&self, upload_id: &UploadId) -> Result<()> {
        let url = self.url(&format!("upload/chunked/pause/{}", upload_id))?;
        self.ack(self.client.post(url)).await
    }

    async fn resume(&self, upload_id: &UploadId) -> Result<Vec<u64>> {
        let response = self
            .client
            .post(self.url(&format!("upload/chunked/resume/{}", upload_id))?)
            .headers(self.headers()?)
            .send()
            .await?;

        let body: ResumeResponse = Self::json(Self::check(response).await?).await?;
        if !body.success {
            return Err(UploadError::TransferFailed(
                body.message.unwrap_or_else(|| "Server refused to resume".to_string()),
            ));
        }

        Ok(body.missing_chunks)
    }

    async fn cancel(&self, upload_id: &UploadId) -> Result<()> {
        let url = self.url(&format!("upload/chunked/cancel/{}", upload_id))?;
        self.ack(self.client.delete(url)).await
    }

    async fn cancel_all(&self) -> Result<()> {
        let url = self.url("upload/chunked/active")?;
        self.ack(self.client.delete(url)).await
    }

    async fn status(&self, upload_id: &UploadId) -> Result<RemoteUpload> {
        let response = self
            .client
            .get(self.url(&format!("upload/chunked/status/{}", upload_id))?)
            .headers(self.headers()?)
            .send()
            .await?;

        let body: ApiResponse<RemoteUpload> = Self::json(Self::check(response).await?).await?;
        body.data
            .filter(|_| body.success)
            .ok_or_else(|| UploadError::NotFound(upload_id.clone()))
    }

    async fn list_active(&self) -> Result<Vec<RemoteUpload>> {
        let response = self
            .client
            .get(self.url("upload/chunked/active")?)
            .headers(self.headers()?)
            .send()
            .await?;

        let body: ApiResponse<Vec<RemoteUpload>> = Self::json(Self::check(response).await?).await?;
        Ok(body.data.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(endpoint: &str) -> HttpUploadService {
        HttpUploadService::new(&RemoteConfig {
            endpoint: endpoint.to_string(),
            token: Some("secret".to_string()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_urls_keep_endpoint_path() {
        let service = service("http://localhost:8080/api");
        let url = service.url("upload/chunked/chunk/abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/upload/chunked/chunk/abc");
    }

    #[test]
    fn test_bearer_header() {
        let headers = service("http://localhost").headers().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
    }

    #[test]
    fn test_finalization_detection() {
        assert!(is_finalization_failure("Finalization failed: missing chunk 3"));
        assert!(!is_finalization_failure("disk full"));
    }

    #[test]
    fn test_wire_bodies() {
        let chunk: ChunkResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(chunk.success && !chunk.completed);

        let resume: ResumeResponse = serde_json::from_str(r#"{"success":true,"missingChunks":[3,4]}"#).unwrap();
        assert_eq!(resume.missing_chunks, vec![3, 4]);

        let active: ApiResponse<Vec<RemoteUpload>> = serde_json::from_str(
            r#"{"success":true,"data":[{"uploadId":"a","fileName":"x.bin","totalChunks":4}]}"#,
        )
        .unwrap();
        assert_eq!(active.data.unwrap()[0].total_chunks, 4);
    }
}
