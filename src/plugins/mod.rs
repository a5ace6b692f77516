//! Datacenter plugins
//!
//! A plugin declares the keyspaces and roles it needs, then converges its
//! own auxiliary state once the core CQL reconciliation is done. Plugins
//! never talk CQL directly: their keyspaces and roles are applied by the
//! keyspace and role reconcilers, in that order.
//!
//! The [`PluginRegistry`] runs the plugins in a fixed order and isolates
//! them from each other: a failing plugin is logged, counted and skipped
//! for the pass.

pub mod kibana;
pub mod managed;
pub mod reaper;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::controller::metrics;
use crate::cql::{CqlKeyspace, CqlRole, ResourceManager};
use crate::crd::{DataCenter, DataCenterStatus};
use crate::error::Result;

pub use kibana::KibanaPlugin;
pub use managed::ManagedPlugin;
pub use reaper::ReaperPlugin;
pub use webhook::WebhookPlugin;

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_active(&self, dc: &DataCenter) -> bool;

    /// Keep reconciling while the datacenter is parked
    fn reconcile_on_park_state(&self) -> bool {
        false
    }

    /// Register required keyspaces, or deregister them when inactive
    fn sync_keyspaces(
        &self,
        keyspaces: &ResourceManager<CqlKeyspace>,
        dc: &DataCenter,
    ) -> Result<()>;

    /// Register required roles, or deregister them when inactive
    fn sync_roles(&self, roles: &ResourceManager<CqlRole>, dc: &DataCenter) -> Result<()>;

    /// Converge the plugin state, returns true if anything changed
    async fn reconcile(&self, dc: &DataCenter, status: &mut DataCenterStatus) -> Result<bool>;

    /// Called once the whole reconciliation pass converged
    async fn reconciled(&self, _dc: &DataCenter, _status: &mut DataCenterStatus) -> Result<()> {
        Ok(())
    }

    /// Tear down the plugin state for a datacenter
    async fn delete(&self, dc: &DataCenter, status: &mut DataCenterStatus) -> Result<()>;
}

#[derive(Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn sync_keyspaces(&self, keyspaces: &ResourceManager<CqlKeyspace>, dc: &DataCenter) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.sync_keyspaces(keyspaces, dc) {
                plugin_failed(plugin.as_ref(), "sync_keyspaces", &e);
            }
        }
    }

    pub fn sync_roles(&self, roles: &ResourceManager<CqlRole>, dc: &DataCenter) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.sync_roles(roles, dc) {
                plugin_failed(plugin.as_ref(), "sync_roles", &e);
            }
        }
    }

    /// Reconcile active plugins and delete the ones that became inactive.
    ///
    /// Returns true if any plugin reported a change.
    pub async fn reconcile(&self, dc: &DataCenter, status: &mut DataCenterStatus) -> bool {
        let parked = dc.spec.parked || status.phase.is_parked();
        let mut changed = false;

        for plugin in &self.plugins {
            let name = plugin.name();
            if plugin.is_active(dc) {
                if parked && !plugin.reconcile_on_park_state() {
                    debug!(plugin = name, "Datacenter parked, plugin skipped");
                    continue;
                }
                if status.active_plugins.insert(name.to_string()) {
                    info!(plugin = name, "Plugin activated");
                }
                match plugin.reconcile(dc, status).await {
                    Ok(plugin_changed) => changed |= plugin_changed,
                    Err(e) => plugin_failed(plugin.as_ref(), "reconcile", &e),
                }
            } else if status.active_plugins.contains(name) {
                match plugin.delete(dc, status).await {
                    Ok(()) => {
                        info!(plugin = name, "Plugin deactivated");
                        status.active_plugins.remove(name);
                        changed = true;
                    }
                    Err(e) => plugin_failed(plugin.as_ref(), "delete", &e),
                }
            }
        }
        changed
    }

    pub async fn reconciled(&self, dc: &DataCenter, status: &mut DataCenterStatus) {
        let parked = dc.spec.parked || status.phase.is_parked();
        for plugin in &self.plugins {
            if !plugin.is_active(dc) || (parked && !plugin.reconcile_on_park_state()) {
                continue;
            }
            if let Err(e) = plugin.reconciled(dc, status).await {
                plugin_failed(plugin.as_ref(), "reconciled", &e);
            }
        }
    }

    /// Delete every plugin that was active, used when the datacenter is removed
    pub async fn delete_all(&self, dc: &DataCenter, status: &mut DataCenterStatus) {
        for plugin in &self.plugins {
            if !status.active_plugins.contains(plugin.name()) && !plugin.is_active(dc) {
                continue;
            }
            match plugin.delete(dc, status).await {
                Ok(()) => {
                    status.active_plugins.remove(plugin.name());
                }
                Err(e) => plugin_failed(plugin.as_ref(), "delete", &e),
            }
        }
    }
}

fn plugin_failed(plugin: &dyn Plugin, call: &str, error: &crate::Error) {
    metrics::inc_plugin_error(plugin.name());
    warn!(plugin = plugin.name(), call, "Plugin failed: {}", error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DataCenterPhase;
    use crate::error::Error;
    use crate::test_support::datacenter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlugin {
        name: &'static str,
        active: bool,
        fail: bool,
        on_park: bool,
        reconciles: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl CountingPlugin {
        fn new(name: &'static str, active: bool, fail: bool) -> Self {
            Self {
                name,
                active,
                fail,
                on_park: false,
                reconciles: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &'static str {
            self.name
        }

        fn is_active(&self, _dc: &DataCenter) -> bool {
            self.active
        }

        fn reconcile_on_park_state(&self) -> bool {
            self.on_park
        }

        fn sync_keyspaces(
            &self,
            keyspaces: &ResourceManager<CqlKeyspace>,
            dc: &DataCenter,
        ) -> Result<()> {
            if self.fail {
                return Err(Error::ConfigError("bad keyspace".to_string()));
            }
            keyspaces.add_if_absent(&dc.datacenter_key(), self.name, || {
                CqlKeyspace::new(self.name, 1, self.name)
            });
            Ok(())
        }

        fn sync_roles(&self, _roles: &ResourceManager<CqlRole>, _dc: &DataCenter) -> Result<()> {
            Ok(())
        }

        async fn reconcile(&self, _dc: &DataCenter, _status: &mut DataCenterStatus) -> Result<bool> {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::PluginError {
                    plugin: self.name.to_string(),
                    message: "backend unavailable".to_string(),
                });
            }
            Ok(true)
        }

        async fn delete(&self, _dc: &DataCenter, _status: &mut DataCenterStatus) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_plugin_does_not_block_others() {
        let failing = Arc::new(CountingPlugin::new("failing", true, true));
        let healthy = Arc::new(CountingPlugin::new("healthy", true, false));
        let registry = PluginRegistry::new(vec![failing.clone(), healthy.clone()]);
        let dc = datacenter("cl1", "dc1");
        let mut status = DataCenterStatus::default();

        let keyspaces = ResourceManager::new();
        registry.sync_keyspaces(&keyspaces, &dc);
        assert_eq!(keyspaces.list(&dc.datacenter_key()).len(), 1);

        assert!(registry.reconcile(&dc, &mut status).await);
        assert_eq!(failing.reconciles.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.reconciles.load(Ordering::SeqCst), 1);
        assert!(status.active_plugins.contains("healthy"));
    }

    #[tokio::test]
    async fn test_inactive_plugin_deleted_once() {
        let plugin = Arc::new(CountingPlugin::new("reaper", false, false));
        let registry = PluginRegistry::new(vec![plugin.clone()]);
        let dc = datacenter("cl1", "dc1");
        let mut status = DataCenterStatus::default();
        status.active_plugins.insert("reaper".to_string());

        registry.reconcile(&dc, &mut status).await;
        registry.reconcile(&dc, &mut status).await;
        assert_eq!(plugin.deletes.load(Ordering::SeqCst), 1);
        assert!(status.active_plugins.is_empty());
    }

    #[tokio::test]
    async fn test_parked_datacenter_skips_plugins_unless_opted_in() {
        let skipped = Arc::new(CountingPlugin::new("skipped", true, false));
        let mut opted = CountingPlugin::new("opted", true, false);
        opted.on_park = true;
        let opted = Arc::new(opted);
        let registry = PluginRegistry::new(vec![skipped.clone(), opted.clone()]);
        let dc = datacenter("cl1", "dc1");
        let mut status = DataCenterStatus {
            phase: DataCenterPhase::Parked,
            ..Default::default()
        };

        registry.reconcile(&dc, &mut status).await;
        assert_eq!(skipped.reconciles.load(Ordering::SeqCst), 0);
        assert_eq!(opted.reconciles.load(Ordering::SeqCst), 1);
    }
}
