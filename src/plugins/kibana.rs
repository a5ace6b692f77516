//! Kibana dashboards
//!
//! Each kibana space stores its saved objects in its own index, backed by a
//! `_kibana[_<space>]` keyspace. A single `kibana` role is granted every
//! space keyspace.

use async_trait::async_trait;
use tracing::info;

use super::Plugin;
use crate::cql::keyspace::quote_identifier;
use crate::cql::{CqlKeyspace, CqlRole, ResourceManager, RoleDescriptor};
use crate::crd::{DataCenter, DataCenterStatus, KibanaSpace};
use crate::error::Result;

pub const KIBANA_ROLE: &str = "kibana";
const OWNER: &str = "kibana";
const DEFAULT_RF: i32 = 3;

/// Index keyspace of a kibana space, the default space has no suffix
pub fn space_keyspace(space: &str) -> String {
    if space.is_empty() {
        "_kibana".to_string()
    } else {
        format!("_kibana_{space}")
    }
}

fn spaces(dc: &DataCenter) -> Vec<KibanaSpace> {
    if dc.spec.kibana.spaces.is_empty() {
        vec![KibanaSpace {
            name: String::new(),
            rf: DEFAULT_RF,
        }]
    } else {
        dc.spec.kibana.spaces.clone()
    }
}

fn role_descriptor(dc: &DataCenter) -> RoleDescriptor {
    let mut descriptor = RoleDescriptor::new(KIBANA_ROLE, OWNER)
        .grant(format!(
            "GRANT SELECT ON KEYSPACE {} TO {KIBANA_ROLE}",
            dc.elastic_admin_keyspace()
        ));
    for space in spaces(dc) {
        descriptor = descriptor.grant(format!(
            "GRANT ALL PERMISSIONS ON KEYSPACE {} TO {KIBANA_ROLE}",
            quote_identifier(&space_keyspace(&space.name))
        ));
    }
    descriptor
}

#[derive(Default)]
pub struct KibanaPlugin;

#[async_trait]
impl Plugin for KibanaPlugin {
    fn name(&self) -> &'static str {
        OWNER
    }

    fn is_active(&self, dc: &DataCenter) -> bool {
        dc.spec.kibana.enabled
    }

    fn sync_keyspaces(
        &self,
        keyspaces: &ResourceManager<CqlKeyspace>,
        dc: &DataCenter,
    ) -> Result<()> {
        let dc_key = dc.datacenter_key();
        if !self.is_active(dc) {
            keyspaces.retain(&dc_key, |_, ks| ks.owner != OWNER);
            return Ok(());
        }

        let wanted: Vec<CqlKeyspace> = spaces(dc)
            .iter()
            .map(|s| CqlKeyspace::new(space_keyspace(&s.name), s.rf, OWNER))
            .collect();
        keyspaces.retain(&dc_key, |name, ks| {
            ks.owner != OWNER || wanted.iter().any(|w| w.name == name)
        });
        for keyspace in wanted {
            if keyspaces.get(&dc_key, &keyspace.name).as_ref() != Some(&keyspace) {
                let name = keyspace.name.clone();
                keyspaces.put(&dc_key, &name, keyspace);
            }
        }
        Ok(())
    }

    fn sync_roles(&self, roles: &ResourceManager<CqlRole>, dc: &DataCenter) -> Result<()> {
        let dc_key = dc.datacenter_key();
        if !self.is_active(dc) {
            roles.retain(&dc_key, |_, role| role.descriptor.owner != OWNER);
            return Ok(());
        }

        let descriptor = role_descriptor(dc);
        let current = roles.get(&dc_key, KIBANA_ROLE);
        let unchanged = current
            .as_ref()
            .is_some_and(|r| r.descriptor.grant_statements == descriptor.grant_statements);
        if !unchanged {
            roles.put(&dc_key, KIBANA_ROLE, descriptor.instantiate());
        }
        Ok(())
    }

    async fn reconcile(&self, dc: &DataCenter, status: &mut DataCenterStatus) -> Result<bool> {
        let names: Vec<String> = spaces(dc).into_iter().map(|s| s.name).collect();
        if status.kibana_spaces == names {
            return Ok(false);
        }
        info!(datacenter = %dc.datacenter_key(), spaces = ?names, "Kibana spaces updated");
        status.kibana_spaces = names;
        Ok(true)
    }

    async fn delete(&self, _dc: &DataCenter, status: &mut DataCenterStatus) -> Result<()> {
        status.kibana_spaces.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::datacenter;

    fn kibana_dc(spaces: &[&str]) -> DataCenter {
        let mut dc = datacenter("cl1", "dc1");
        dc.spec.kibana.enabled = true;
        dc.spec.kibana.spaces = spaces
            .iter()
            .map(|name| KibanaSpace {
                name: name.to_string(),
                rf: 2,
            })
            .collect();
        dc
    }

    #[test]
    fn test_default_space() {
        let mut dc = datacenter("cl1", "dc1");
        dc.spec.kibana.enabled = true;
        let keyspaces = ResourceManager::new();
        KibanaPlugin.sync_keyspaces(&keyspaces, &dc).unwrap();
        let registered = keyspaces.list(&dc.datacenter_key());
        assert_eq!(registered, vec![CqlKeyspace::new("_kibana", 3, "kibana")]);
    }

    #[test]
    fn test_grants_follow_spaces() {
        let dc = kibana_dc(&["sales"]);
        let roles = ResourceManager::new();
        KibanaPlugin.sync_roles(&roles, &dc).unwrap();

        let key = dc.datacenter_key();
        let role = roles.get(&key, KIBANA_ROLE).unwrap();
        assert!(role
            .descriptor
            .grant_statements
            .contains(&"GRANT ALL PERMISSIONS ON KEYSPACE \"_kibana_sales\" TO kibana".to_string()));

        roles.update(&key, KIBANA_ROLE, |r| r.applied = true);
        KibanaPlugin.sync_roles(&roles, &dc).unwrap();
        assert!(roles.get(&key, KIBANA_ROLE).unwrap().applied);

        let dc = kibana_dc(&["sales", "ops"]);
        KibanaPlugin.sync_roles(&roles, &dc).unwrap();
        let role = roles.get(&key, KIBANA_ROLE).unwrap();
        assert!(!role.applied);
        assert_eq!(role.descriptor.grant_statements.len(), 3);
    }

    #[test]
    fn test_removed_space_deregistered() {
        let keyspaces = ResourceManager::new();
        let dc = kibana_dc(&["sales", "ops"]);
        KibanaPlugin.sync_keyspaces(&keyspaces, &dc).unwrap();
        let dc = kibana_dc(&["ops"]);
        KibanaPlugin.sync_keyspaces(&keyspaces, &dc).unwrap();

        let names: Vec<String> = keyspaces
            .list(&dc.datacenter_key())
            .into_iter()
            .map(|k| k.name)
            .collect();
        assert_eq!(names, vec!["_kibana_ops"]);
    }

    #[tokio::test]
    async fn test_status_spaces() {
        let dc = kibana_dc(&["sales"]);
        let mut status = DataCenterStatus::default();
        assert!(KibanaPlugin.reconcile(&dc, &mut status).await.unwrap());
        assert!(!KibanaPlugin.reconcile(&dc, &mut status).await.unwrap());
        assert_eq!(status.kibana_spaces, vec!["sales"]);

        KibanaPlugin.delete(&dc, &mut status).await.unwrap();
        assert!(status.kibana_spaces.is_empty());
    }
}
