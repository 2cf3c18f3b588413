//! Canary release endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use cygni_core::domain::canary::CanaryRelease;
use cygni_core::dto::canary::{CanaryView, RollbackCanary, StartCanary, UpdateTraffic};
use uuid::Uuid;

impl OrchestratorClient {
    /// Start a canary; fails with `CANARY_ALREADY_ACTIVE` if one is running
    pub async fn start_canary(&self, req: StartCanary) -> Result<CanaryRelease> {
        let response = self.client.post(self.url("/canary")).json(&req).send().await?;
        self.handle_response(response).await
    }

    pub async fn get_canary(&self, canary_id: Uuid) -> Result<CanaryView> {
        let url = self.url(&format!("/canary/{}", canary_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    pub async fn list_canaries(&self, deployment_id: Uuid) -> Result<Vec<CanaryRelease>> {
        let url = self.url(&format!("/canary/deployment/{}", deployment_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    pub async fn promote_canary(&self, canary_id: Uuid) -> Result<CanaryRelease> {
        let url = self.url(&format!("/canary/{}/promote", canary_id));
        let response = self.client.post(&url).send().await?;
        self.handle_response(response).await
    }

    pub async fn rollback_canary(
        &self,
        canary_id: Uuid,
        reason: Option<String>,
    ) -> Result<CanaryRelease> {
        let url = self.url(&format!("/canary/{}/rollback", canary_id));
        let response = self
            .client
            .post(&url)
            .json(&RollbackCanary { reason })
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn pause_canary(&self, canary_id: Uuid) -> Result<CanaryRelease> {
        let url = self.url(&format!("/canary/{}/pause", canary_id));
        let response = self.client.post(&url).send().await?;
        self.handle_response(response).await
    }

    /// Set the split; the percentages must add up to 100
    pub async fn update_traffic(
        &self,
        canary_id: Uuid,
        canary_percentage: f64,
        stable_percentage: f64,
    ) -> Result<CanaryRelease> {
        let url = self.url(&format!("/canary/{}/traffic", canary_id));
        let response = self
            .client
            .post(&url)
            .json(&UpdateTraffic {
                canary_percentage,
                stable_percentage,
            })
            .send()
            .await?;
        self.handle_response(response).await
    }
}
