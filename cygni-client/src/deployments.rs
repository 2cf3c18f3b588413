//! Deployment and routing reads

use crate::OrchestratorClient;
use crate::error::Result;
use cygni_core::domain::deployment::Deployment;
use cygni_core::domain::routing::VariantWeight;
use uuid::Uuid;

impl OrchestratorClient {
    pub async fn get_deployment(&self, deployment_id: Uuid) -> Result<Deployment> {
        let url = self.url(&format!("/deployment/{}", deployment_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    pub async fn list_deployments(&self, project_id: &str) -> Result<Vec<Deployment>> {
        let url = self.url(&format!("/deployment/project/{}", project_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    /// Weights the traffic router currently applies for a project
    pub async fn get_routing(&self, project_id: &str) -> Result<Vec<VariantWeight>> {
        let url = self.url(&format!("/routing/{}", project_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }
}
