//! Worker side of the build queue

use crate::OrchestratorClient;
use crate::error::Result;
use cygni_core::domain::build::{Build, BuildOutcome};
use cygni_core::domain::log::LogEntry;
use cygni_core::dto::build::{
    CancelAck, ClaimBuild, ClaimedBuild, CompleteBuild, Heartbeat, HeartbeatAck,
};
use cygni_core::dto::log::LogBatch;
use uuid::Uuid;

impl OrchestratorClient {
    /// Lease the next available build; `None` when the queue is empty
    pub async fn claim_build(&self, worker_id: &str) -> Result<Option<ClaimedBuild>> {
        let response = self
            .client
            .post(self.url("/queue/claim"))
            .json(&ClaimBuild {
                worker_id: worker_id.to_string(),
            })
            .send()
            .await?;

        self.handle_optional_response(response).await
    }

    /// Renew a lease. The answer says whether the build was cancelled.
    pub async fn heartbeat(
        &self,
        build_id: Uuid,
        worker_id: &str,
        lease_token: Uuid,
    ) -> Result<HeartbeatAck> {
        let url = self.url(&format!("/build/{}/heartbeat", build_id));
        let response = self
            .client
            .post(&url)
            .json(&Heartbeat {
                worker_id: worker_id.to_string(),
                lease_token,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn complete_build(
        &self,
        build_id: Uuid,
        worker_id: &str,
        lease_token: Uuid,
        outcome: BuildOutcome,
    ) -> Result<Build> {
        let url = self.url(&format!("/build/{}/complete", build_id));
        let response = self
            .client
            .post(&url)
            .json(&CompleteBuild {
                worker_id: worker_id.to_string(),
                lease_token,
                outcome,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Confirm a cancelled build was stopped, reporting a failed teardown
    pub async fn ack_cancel(
        &self,
        build_id: Uuid,
        worker_id: &str,
        lease_token: Uuid,
        termination_error: Option<String>,
    ) -> Result<Build> {
        let url = self.url(&format!("/build/{}/cancel/ack", build_id));
        let response = self
            .client
            .post(&url)
            .json(&CancelAck {
                worker_id: worker_id.to_string(),
                lease_token,
                termination_error,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Send a log batch for a leased build
    pub async fn send_logs(
        &self,
        build_id: Uuid,
        worker_id: &str,
        lease_token: Uuid,
        entries: Vec<LogEntry>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let url = self.url(&format!("/build/{}/logs", build_id));
        let response = self
            .client
            .post(&url)
            .json(&LogBatch {
                worker_id: worker_id.to_string(),
                lease_token,
                entries,
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
