//! Service implementations backed by the REST + SSE API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use quillrun_core::{
    AnalysisTaskId, AnalysisTaskState, BatchId, BatchJob, BatchParameters, GenerationRequest,
    ProjectId, ServiceError, Unit, UnitId,
};
use quillrun_engine::services::{
    AnalysisService, BatchStore, GenerationService, GenerationStream, UnitStore,
};

use crate::error::ClientError;
use crate::http::HttpClient;
use crate::sse::event_stream;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StartAnalysisResponse {
    pub task_id: AnalysisTaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CreateBatchRequest {
    pub start_sequence: u32,
    pub count: u32,
    pub total: u32,
    pub parameters: BatchParameters,
}

/// Client for the writing backend. Implements every engine service.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: HttpClient,
}

impl ApiClient {
    /// Create a client for the API at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = HttpClient::new(base_url)?;
        debug!(base_url = %http.base_url(), "API client created");
        Ok(Self { http })
    }
}

#[async_trait]
impl UnitStore for ApiClient {
    async fn units(&self, project_id: &ProjectId) -> Result<Vec<Unit>, ServiceError> {
        let path = format!("/api/projects/{}/units", project_id);
        Ok(self.http.get_json(&path).await?)
    }

    async fn unit(&self, unit_id: &UnitId) -> Result<Unit, ServiceError> {
        Ok(self.http.get_json(&format!("/api/units/{}", unit_id)).await?)
    }

    async fn refresh_statistics(&self, project_id: &ProjectId) -> Result<(), ServiceError> {
        let path = format!("/api/projects/{}/statistics/refresh", project_id);
        Ok(self.http.post_empty(&path).await?)
    }
}

#[async_trait]
impl AnalysisService for ApiClient {
    async fn start(&self, unit_id: &UnitId) -> Result<AnalysisTaskId, ServiceError> {
        let path = format!("/api/units/{}/analysis", unit_id);
        let response: StartAnalysisResponse = self.http.post_json(&path, &()).await?;
        debug!(unit_id = %unit_id, task_id = %response.task_id, "Analysis started");
        Ok(response.task_id)
    }

    async fn status(&self, unit_id: &UnitId) -> Result<AnalysisTaskState, ServiceError> {
        let path = format!("/api/units/{}/analysis", unit_id);
        Ok(self.http.get_json(&path).await?)
    }
}

#[async_trait]
impl GenerationService for ApiClient {
    async fn open(&self, request: &GenerationRequest) -> Result<GenerationStream, ServiceError> {
        let path = format!("/api/units/{}/generate", request.unit_id);
        let response = self.http.post_stream(&path, request).await?;
        debug!(unit_id = %request.unit_id, "Generation stream opened");
        Ok(Box::pin(event_stream(response.bytes_stream())))
    }
}

#[async_trait]
impl BatchStore for ApiClient {
    async fn create(
        &self,
        project_id: &ProjectId,
        start_sequence: u32,
        count: u32,
        parameters: &BatchParameters,
        total: u32,
    ) -> Result<BatchJob, ServiceError> {
        let path = format!("/api/projects/{}/batches", project_id);
        let body = CreateBatchRequest {
            start_sequence,
            count,
            total,
            parameters: parameters.clone(),
        };
        Ok(self.http.post_json(&path, &body).await?)
    }

    async fn status(&self, batch_id: &BatchId) -> Result<BatchJob, ServiceError> {
        Ok(self.http.get_json(&format!("/api/batches/{}", batch_id)).await?)
    }

    async fn cancel(&self, batch_id: &BatchId) -> Result<(), ServiceError> {
        let path = format!("/api/batches/{}/cancel", batch_id);
        Ok(self.http.post_empty(&path).await?)
    }

    async fn active(&self, project_id: &ProjectId) -> Result<Option<BatchJob>, ServiceError> {
        let path = format!("/api/projects/{}/batches/active", project_id);
        Ok(self.http.get_optional_json(&path).await?)
    }

    async fn update(&self, job: &BatchJob) -> Result<(), ServiceError> {
        let path = format!("/api/batches/{}", job.batch_id);
        Ok(self.http.put_json(&path, job).await?)
    }
}
