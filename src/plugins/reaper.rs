//! Cassandra Reaper integration
//!
//! Reaper stores its state in the `reaper_db` keyspace and connects with its
//! own role. Once the role has been granted its keyspace, the datacenter is
//! registered in the reaper backend so repairs can be scheduled:
//!
//! ```text
//! None --(role created)--> RoleCreated --(registered)--> Registered
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::Plugin;
use crate::cql::{
    CqlKeyspace, CqlRole, CqlSession, ResourceManager, RoleDescriptor, RoleHook, REAPER_ROLE,
};
use crate::crd::{Authentication, DataCenter, DataCenterStatus, ReaperPhase};
use crate::error::Result;
use crate::http::HttpClient;

pub const REAPER_KEYSPACE: &str = "reaper_db";
const REAPER_KEYSPACE_RF: i32 = 3;
const OWNER: &str = "reaper";

struct GrantReaperKeyspace;

#[async_trait]
impl RoleHook for GrantReaperKeyspace {
    async fn after_create(
        &self,
        session: &dyn CqlSession,
        _dc: &DataCenter,
        status: &mut DataCenterStatus,
    ) -> Result<()> {
        session
            .execute(&format!(
                "GRANT ALL PERMISSIONS ON KEYSPACE {REAPER_KEYSPACE} TO {REAPER_ROLE}"
            ))
            .await?;
        if status.reaper_phase == ReaperPhase::None {
            status.reaper_phase = ReaperPhase::RoleCreated;
        }
        Ok(())
    }
}

pub struct ReaperPlugin {
    client: HttpClient,
}

impl ReaperPlugin {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    fn reaper_url(dc: &DataCenter) -> String {
        dc.spec.reaper.url.clone().unwrap_or_else(|| {
            format!(
                "http://{}-reaper.{}.svc.cluster.local:8080",
                dc.resource_prefix(),
                dc.namespace_or_default()
            )
        })
    }
}

#[async_trait]
impl Plugin for ReaperPlugin {
    fn name(&self) -> &'static str {
        OWNER
    }

    fn is_active(&self, dc: &DataCenter) -> bool {
        dc.spec.reaper.enabled
    }

    fn sync_keyspaces(
        &self,
        keyspaces: &ResourceManager<CqlKeyspace>,
        dc: &DataCenter,
    ) -> Result<()> {
        let dc_key = dc.datacenter_key();
        if self.is_active(dc) {
            keyspaces.add_if_absent(&dc_key, REAPER_KEYSPACE, || {
                CqlKeyspace::new(REAPER_KEYSPACE, REAPER_KEYSPACE_RF, OWNER)
            });
        } else {
            keyspaces.retain(&dc_key, |_, ks| ks.owner != OWNER);
        }
        Ok(())
    }

    fn sync_roles(&self, roles: &ResourceManager<CqlRole>, dc: &DataCenter) -> Result<()> {
        let dc_key = dc.datacenter_key();
        if self.is_active(dc) {
            roles.add_if_absent(&dc_key, REAPER_ROLE, || {
                RoleDescriptor::reaper()
                    .post_create(Arc::new(GrantReaperKeyspace))
                    .instantiate()
            });
        } else {
            roles.retain(&dc_key, |_, role| role.descriptor.owner != OWNER);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(datacenter = %dc.datacenter_key()))]
    async fn reconcile(&self, dc: &DataCenter, status: &mut DataCenterStatus) -> Result<bool> {
        // Without authentication there is no role to wait for
        if status.reaper_phase == ReaperPhase::None
            && dc.spec.authentication == Authentication::None
            && status.keyspaces_created.contains(REAPER_KEYSPACE)
        {
            status.reaper_phase = ReaperPhase::RoleCreated;
        }

        if status.reaper_phase != ReaperPhase::RoleCreated {
            return Ok(false);
        }

        let url = format!(
            "{}/cluster?seedHost={}&jmxPort={}",
            Self::reaper_url(dc).trim_end_matches('/'),
            dc.service_host(),
            dc.spec.reaper.jmx_port
        );
        self.client.post(&url).await?;
        info!("Datacenter registered in reaper");
        status.reaper_phase = ReaperPhase::Registered;
        Ok(true)
    }

    async fn delete(&self, _dc: &DataCenter, status: &mut DataCenterStatus) -> Result<()> {
        status.reaper_phase = ReaperPhase::None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RetryPolicy;
    use crate::test_support::{datacenter, FakeSession};
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plugin() -> ReaperPlugin {
        let client = HttpClient::new(
            Duration::from_secs(2),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
        )
        .unwrap();
        ReaperPlugin::new(client)
    }

    #[test]
    fn test_default_url() {
        let dc = datacenter("cl1", "dc1");
        assert_eq!(
            ReaperPlugin::reaper_url(&dc),
            "http://elassandra-cl1-dc1-reaper.db.svc.cluster.local:8080"
        );
    }

    #[test]
    fn test_sync_follows_enabled_flag() {
        let mut dc = datacenter("cl1", "dc1");
        dc.spec.reaper.enabled = true;
        let keyspaces = ResourceManager::new();
        let roles = ResourceManager::new();
        let plugin = plugin();

        plugin.sync_keyspaces(&keyspaces, &dc).unwrap();
        plugin.sync_roles(&roles, &dc).unwrap();
        assert!(keyspaces.get(&dc.datacenter_key(), REAPER_KEYSPACE).is_some());
        assert!(roles.get(&dc.datacenter_key(), REAPER_ROLE).is_some());

        dc.spec.reaper.enabled = false;
        plugin.sync_keyspaces(&keyspaces, &dc).unwrap();
        plugin.sync_roles(&roles, &dc).unwrap();
        assert!(keyspaces.list(&dc.datacenter_key()).is_empty());
        assert!(roles.list(&dc.datacenter_key()).is_empty());
    }

    #[tokio::test]
    async fn test_role_hook_grants_keyspace() {
        let dc = datacenter("cl1", "dc1");
        let session = FakeSession::default();
        let mut status = DataCenterStatus::default();
        GrantReaperKeyspace
            .after_create(&session, &dc, &mut status)
            .await
            .unwrap();
        assert_eq!(
            session.statements(),
            vec!["GRANT ALL PERMISSIONS ON KEYSPACE reaper_db TO reaper"]
        );
        assert_eq!(status.reaper_phase, ReaperPhase::RoleCreated);
    }

    #[tokio::test]
    async fn test_registers_once_role_created() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cluster"))
            .and(query_param("seedHost", "elassandra-cl1-dc1.db.svc.cluster.local"))
            .and(query_param("jmxPort", "7199"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut dc = datacenter("cl1", "dc1");
        dc.spec.reaper.enabled = true;
        dc.spec.reaper.url = Some(server.uri());
        dc.spec.reaper.jmx_port = 7199;
        let plugin = plugin();

        let mut status = DataCenterStatus::default();
        assert!(!plugin.reconcile(&dc, &mut status).await.unwrap());

        status.reaper_phase = ReaperPhase::RoleCreated;
        assert!(plugin.reconcile(&dc, &mut status).await.unwrap());
        assert_eq!(status.reaper_phase, ReaperPhase::Registered);
        assert!(!plugin.reconcile(&dc, &mut status).await.unwrap());

        plugin.delete(&dc, &mut status).await.unwrap();
        assert_eq!(status.reaper_phase, ReaperPhase::None);
    }

    #[tokio::test]
    async fn test_registration_failure_keeps_phase() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut dc = datacenter("cl1", "dc1");
        dc.spec.reaper.enabled = true;
        dc.spec.reaper.url = Some(server.uri());
        let mut status = DataCenterStatus {
            reaper_phase: ReaperPhase::RoleCreated,
            ..Default::default()
        };
        assert!(plugin().reconcile(&dc, &mut status).await.is_err());
        assert_eq!(status.reaper_phase, ReaperPhase::RoleCreated);
    }
}
