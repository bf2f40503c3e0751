use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use clearscan_model::{JobId, WorkerJobRequest, WorkerJobState, WorkerJobStatus};

use super::{ScanWorker, WorkerError};
use crate::error::{Result, ScanError};
use crate::orchestration::config::WorkerConfig;

/// `reqwest` client for the scanner worker's `/job` endpoints.
#[derive(Clone)]
pub struct HttpScanWorker {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for HttpScanWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpScanWorker")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl HttpScanWorker {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw).map_err(|e| {
            ScanError::InvalidRequest(format!("invalid worker URL `{}`: {e}", config.base_url))
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ScanError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, WorkerError> {
        self.base_url
            .join(path)
            .map_err(|e| WorkerError::Decode(format!("cannot build worker URL: {e}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ScanWorker for HttpScanWorker {
    async fn submit(&self, request: &WorkerJobRequest) -> std::result::Result<(), WorkerError> {
        let url = self.endpoint("job")?;
        let response = self
            .authorize(self.client.post(url.clone()))
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Status {
                status,
                url: url.to_string(),
            });
        }
        debug!(job_id = %request.job_id, files = request.files.len(), "submitted job to worker");
        Ok(())
    }

    async fn job_status(&self, job_id: JobId) -> std::result::Result<WorkerJobStatus, WorkerError> {
        let url = self.endpoint(&format!("job/{job_id}"))?;
        let response = match self.authorize(self.client.get(url.clone())).send().await {
            Ok(response) => response,
            Err(err) if err.is_connect() || err.is_timeout() => {
                debug!(%job_id, error = %err, "worker unreachable");
                return Ok(WorkerJobStatus::of(WorkerJobState::NoConnection));
            }
            Err(err) => return Err(err.into()),
        };

        match response.status() {
            StatusCode::NOT_FOUND => Ok(WorkerJobStatus::of(WorkerJobState::NotFound)),
            status if status.is_success() => response
                .json::<WorkerJobStatus>()
                .await
                .map_err(|e| WorkerError::Decode(e.to_string())),
            status => Err(WorkerError::Status {
                status,
                url: url.to_string(),
            }),
        }
    }
}
