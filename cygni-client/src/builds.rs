//! Build endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use cygni_core::domain::build::Build;
use cygni_core::domain::log::LogEntry;
use cygni_core::dto::build::{BuildSummary, BuildView, SubmitBuild};
use uuid::Uuid;

impl OrchestratorClient {
    /// Submit a build; it is queued as pending
    pub async fn submit_build(&self, req: SubmitBuild) -> Result<Build> {
        let response = self.client.post(self.url("/build")).json(&req).send().await?;
        self.handle_response(response).await
    }

    /// Status with accumulated log text
    pub async fn get_build(&self, build_id: Uuid) -> Result<BuildView> {
        let url = self.url(&format!("/build/{}", build_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    pub async fn list_builds(&self, project_id: &str) -> Result<Vec<BuildSummary>> {
        let url = self.url(&format!("/build/project/{}", project_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    /// Stored log entries of a build
    pub async fn get_build_logs(&self, build_id: Uuid) -> Result<Vec<LogEntry>> {
        let url = self.url(&format!("/build/{}/logs", build_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    /// Cancel a build. A finished build comes back unchanged.
    pub async fn cancel_build(&self, build_id: Uuid) -> Result<Build> {
        let url = self.url(&format!("/build/{}/cancel", build_id));
        let response = self.client.post(&url).send().await?;
        self.handle_response(response).await
    }

    pub async fn delete_build(&self, build_id: Uuid) -> Result<()> {
        let url = self.url(&format!("/build/{}", build_id));
        let response = self.client.delete(&url).send().await?;
        self.handle_empty_response(response).await
    }
}
