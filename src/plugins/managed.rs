//! Keyspaces and roles declared directly in the DataCenter spec

use async_trait::async_trait;

use super::Plugin;
use crate::cql::{CqlKeyspace, CqlRole, ResourceManager, RoleDescriptor};
use crate::crd::{DataCenter, DataCenterStatus};
use crate::error::Result;

const OWNER: &str = "managed";

#[derive(Default)]
pub struct ManagedPlugin;

#[async_trait]
impl Plugin for ManagedPlugin {
    fn name(&self) -> &'static str {
        OWNER
    }

    fn is_active(&self, dc: &DataCenter) -> bool {
        !dc.spec.keyspaces.is_empty() || !dc.spec.roles.is_empty()
    }

    fn sync_keyspaces(
        &self,
        keyspaces: &ResourceManager<CqlKeyspace>,
        dc: &DataCenter,
    ) -> Result<()> {
        let dc_key = dc.datacenter_key();
        keyspaces.retain(&dc_key, |name, ks| {
            ks.owner != OWNER || dc.spec.keyspaces.iter().any(|k| k.name == name)
        });
        for spec in &dc.spec.keyspaces {
            let desired = CqlKeyspace::new(spec.name.clone(), spec.rf, OWNER);
            match keyspaces.get(&dc_key, &spec.name) {
                Some(existing) if existing.rf == spec.rf => {}
                _ => keyspaces.put(&dc_key, &spec.name, desired),
            }
        }
        Ok(())
    }

    fn sync_roles(&self, roles: &ResourceManager<CqlRole>, dc: &DataCenter) -> Result<()> {
        let dc_key = dc.datacenter_key();
        roles.retain(&dc_key, |name, role| {
            role.descriptor.owner != OWNER || dc.spec.roles.iter().any(|r| r.username == name)
        });
        for spec in &dc.spec.roles {
            let descriptor = RoleDescriptor::from_spec(spec, OWNER);
            let changed = match roles.get(&dc_key, &spec.username) {
                Some(existing) => {
                    existing.descriptor.superuser != descriptor.superuser
                        || existing.descriptor.login != descriptor.login
                        || existing.descriptor.grant_statements != descriptor.grant_statements
                        || existing.descriptor.secret != descriptor.secret
                        || existing.descriptor.secret_key != descriptor.secret_key
                }
                None => true,
            };
            if changed {
                roles.put(&dc_key, &spec.username, descriptor.instantiate());
            }
        }
        Ok(())
    }

    async fn reconcile(&self, _dc: &DataCenter, _status: &mut DataCenterStatus) -> Result<bool> {
        Ok(false)
    }

    async fn delete(&self, _dc: &DataCenter, _status: &mut DataCenterStatus) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KeyspaceSpec, RoleSpec};
    use crate::test_support::datacenter;

    fn role_spec(username: &str) -> RoleSpec {
        RoleSpec {
            username: username.to_string(),
            secret_name: None,
            secret_key: None,
            superuser: false,
            login: true,
            grant_statements: vec![format!("GRANT SELECT ON KEYSPACE app TO {username}")],
        }
    }

    #[test]
    fn test_sync_tracks_spec() {
        let mut dc = datacenter("cl1", "dc1");
        dc.spec.keyspaces = vec![
            KeyspaceSpec {
                name: "app".to_string(),
                rf: 3,
            },
            KeyspaceSpec {
                name: "audit".to_string(),
                rf: 2,
            },
        ];
        let keyspaces = ResourceManager::new();
        let plugin = ManagedPlugin;
        assert!(plugin.is_active(&dc));
        plugin.sync_keyspaces(&keyspaces, &dc).unwrap();
        assert_eq!(keyspaces.list(&dc.datacenter_key()).len(), 2);

        // keyspaces registered by another owner survive
        keyspaces.put(&dc.datacenter_key(), "reaper_db", CqlKeyspace::new("reaper_db", 3, "reaper"));
        dc.spec.keyspaces.truncate(1);
        dc.spec.keyspaces[0].rf = 1;
        plugin.sync_keyspaces(&keyspaces, &dc).unwrap();

        let names: Vec<String> = keyspaces
            .list(&dc.datacenter_key())
            .into_iter()
            .map(|k| k.name)
            .collect();
        assert_eq!(names, vec!["app", "reaper_db"]);
        assert_eq!(keyspaces.get(&dc.datacenter_key(), "app").unwrap().rf, 1);
    }

    #[test]
    fn test_role_redeclared_only_on_change() {
        let mut dc = datacenter("cl1", "dc1");
        dc.spec.roles = vec![role_spec("app")];
        let roles = ResourceManager::new();
        let plugin = ManagedPlugin;
        plugin.sync_roles(&roles, &dc).unwrap();

        let key = dc.datacenter_key();
        roles.update(&key, "app", |r| {
            r.password = Some("secret".to_string());
            r.applied = true;
        });
        plugin.sync_roles(&roles, &dc).unwrap();
        assert!(roles.get(&key, "app").unwrap().applied);

        dc.spec.roles[0].superuser = true;
        plugin.sync_roles(&roles, &dc).unwrap();
        let role = roles.get(&key, "app").unwrap();
        assert!(!role.applied);
        assert!(role.descriptor.superuser);

        dc.spec.roles.clear();
        plugin.sync_roles(&roles, &dc).unwrap();
        assert!(roles.get(&key, "app").is_none());
    }
}
