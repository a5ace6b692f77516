//! Outbound notification of datacenter phase changes

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::Plugin;
use crate::cql::{CqlKeyspace, CqlRole, ResourceManager};
use crate::crd::{CqlStatus, DataCenter, DataCenterPhase, DataCenterStatus};
use crate::error::Result;
use crate::http::HttpClient;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PhaseNotification<'a> {
    namespace: String,
    cluster: &'a str,
    datacenter: &'a str,
    phase: DataCenterPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_phase: Option<DataCenterPhase>,
    replicas: i32,
    ready_replicas: i32,
    cql_status: CqlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

pub struct WebhookPlugin {
    client: HttpClient,
}

impl WebhookPlugin {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Plugin for WebhookPlugin {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn is_active(&self, dc: &DataCenter) -> bool {
        dc.spec.webhook.is_some()
    }

    fn reconcile_on_park_state(&self) -> bool {
        true
    }

    fn sync_keyspaces(
        &self,
        _keyspaces: &ResourceManager<CqlKeyspace>,
        _dc: &DataCenter,
    ) -> Result<()> {
        Ok(())
    }

    fn sync_roles(&self, _roles: &ResourceManager<CqlRole>, _dc: &DataCenter) -> Result<()> {
        Ok(())
    }

    async fn reconcile(&self, _dc: &DataCenter, _status: &mut DataCenterStatus) -> Result<bool> {
        Ok(false)
    }

    async fn reconciled(&self, dc: &DataCenter, status: &mut DataCenterStatus) -> Result<()> {
        let Some(webhook) = &dc.spec.webhook else {
            return Ok(());
        };
        if status.last_notified_phase == Some(status.phase) {
            return Ok(());
        }

        let notification = PhaseNotification {
            namespace: dc.namespace_or_default(),
            cluster: &dc.spec.cluster_name,
            datacenter: &dc.spec.datacenter_name,
            phase: status.phase,
            previous_phase: status.last_notified_phase,
            replicas: status.replicas,
            ready_replicas: status.ready_replicas,
            cql_status: status.cql_status,
            message: status.last_message.as_deref(),
        };
        self.client.post_json(&webhook.url, &notification).await?;
        info!(
            datacenter = %dc.datacenter_key(),
            phase = %status.phase,
            "Phase change notified"
        );
        status.last_notified_phase = Some(status.phase);
        Ok(())
    }

    async fn delete(&self, _dc: &DataCenter, status: &mut DataCenterStatus) -> Result<()> {
        status.last_notified_phase = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WebhookSpec;
    use crate::http::RetryPolicy;
    use crate::test_support::datacenter;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plugin() -> WebhookPlugin {
        let client = HttpClient::new(
            Duration::from_secs(2),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        )
        .unwrap();
        WebhookPlugin::new(client)
    }

    #[tokio::test]
    async fn test_notifies_each_phase_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(body_partial_json(serde_json::json!({
                "cluster": "cl1",
                "datacenter": "dc1",
                "phase": "RUNNING"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut dc = datacenter("cl1", "dc1");
        dc.spec.webhook = Some(WebhookSpec {
            url: format!("{}/events", server.uri()),
        });
        let plugin = plugin();
        let mut status = DataCenterStatus {
            phase: DataCenterPhase::Running,
            ..Default::default()
        };

        plugin.reconciled(&dc, &mut status).await.unwrap();
        plugin.reconciled(&dc, &mut status).await.unwrap();
        assert_eq!(status.last_notified_phase, Some(DataCenterPhase::Running));
    }

    #[tokio::test]
    async fn test_failed_notification_is_retried_next_pass() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let mut dc = datacenter("cl1", "dc1");
        dc.spec.webhook = Some(WebhookSpec { url: server.uri() });
        let mut status = DataCenterStatus {
            phase: DataCenterPhase::Parked,
            ..Default::default()
        };

        assert!(plugin().reconciled(&dc, &mut status).await.is_err());
        assert!(status.last_notified_phase.is_none());
        assert!(plugin().reconcile_on_park_state());
    }
}
