//! One reconciliation pass over a DataCenter
//!
//! A pass computes the next status from the resource, its rack StatefulSets
//! and the live cluster:
//!
//! 1. validate the spec
//! 2. derive the phase from the StatefulSets
//! 3. let plugins register keyspaces and roles, load role passwords
//! 4. when the phase is ready: open a CQL session, reconcile keyspaces then roles
//! 5. reconcile plugins, refresh conditions, notify `reconciled`
//!
//! The caller persists the returned status. CQL sessions never outlive a pass.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use tracing::{debug, info, instrument, warn};

use super::conditions::update_datacenter_conditions;
use super::phase::{next_phase, Observation};
use crate::cql::{CqlConnector, KeyspaceReconciler, RoleReconciler, SessionHandler};
use crate::crd::{Authentication, DataCenter, DataCenterPhase, DataCenterStatus};
use crate::error::{Error, Result};
use crate::plugins::PluginRegistry;

pub struct DataCenterReconciler {
    connector: Arc<dyn CqlConnector>,
    default_password: String,
    keyspaces: KeyspaceReconciler,
    roles: RoleReconciler,
    plugins: PluginRegistry,
}

impl DataCenterReconciler {
    pub fn new(
        connector: Arc<dyn CqlConnector>,
        default_password: impl Into<String>,
        keyspaces: KeyspaceReconciler,
        roles: RoleReconciler,
        plugins: PluginRegistry,
    ) -> Self {
        Self {
            connector,
            default_password: default_password.into(),
            keyspaces,
            roles,
            plugins,
        }
    }

    pub fn keyspaces(&self) -> &KeyspaceReconciler {
        &self.keyspaces
    }

    pub fn roles(&self) -> &RoleReconciler {
        &self.roles
    }

    /// Run one pass and return the status to persist.
    ///
    /// Failures are recorded in the returned status (`Error` phase,
    /// `last_error`) instead of being propagated.
    #[instrument(skip_all, fields(datacenter = %dc.datacenter_key()))]
    pub async fn reconcile(&self, dc: &DataCenter, statefulsets: &[StatefulSet]) -> DataCenterStatus {
        let mut status = dc.status.clone().unwrap_or_default();

        match self.run_pass(dc, statefulsets, &mut status).await {
            Ok(()) => {
                status.last_error = None;
            }
            Err(e) => {
                warn!("Reconciliation failed: {}", e);
                status.phase = DataCenterPhase::Error;
                status.last_error = Some(e.to_string());
                status.last_message = Some(format!("Reconciliation failed ({})", e.metric_kind()));
            }
        }

        status.observed_generation = dc.metadata.generation;
        update_datacenter_conditions(&mut status, dc.metadata.generation);
        // Runs last so the notification carries the final phase
        self.plugins.reconciled(dc, &mut status).await;
        status
    }

    async fn run_pass(
        &self,
        dc: &DataCenter,
        statefulsets: &[StatefulSet],
        status: &mut DataCenterStatus,
    ) -> Result<()> {
        if let Err(errors) = dc.spec.validate() {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::ValidationError(message));
        }

        let observed = Observation::from_statefulsets(dc, statefulsets);
        let generation_changed = dc.metadata.generation != status.observed_generation;
        let phase = next_phase(status.phase, dc, &observed, generation_changed);
        if phase != status.phase {
            info!(from = %status.phase, to = %phase, "Phase changed");
        }
        status.phase = phase;
        status.replicas = observed.replicas();
        status.ready_replicas = observed.ready_replicas();
        status.rack_statuses = observed.racks;
        if phase == DataCenterPhase::Running {
            status.bootstrapped = true;
        }
        if generation_changed {
            // Declared replication factors may have changed
            status.keyspace_replicas_observed = None;
        }

        self.plugins.sync_keyspaces(self.keyspaces.manager(), dc);
        self.plugins.sync_roles(self.roles.manager(), dc);

        let authenticated = dc.spec.authentication != Authentication::None;
        if authenticated {
            self.roles.ensure_builtin_roles(dc);
            self.roles.load_passwords(dc).await?;
        }

        if phase.is_ready() {
            self.reconcile_cql(dc, status, authenticated).await?;
        } else {
            debug!(phase = %phase, "Datacenter not ready, CQL reconciliation skipped");
        }

        if self.plugins.reconcile(dc, status).await {
            debug!("Plugins updated the datacenter state");
        }
        status.last_message = Some(format!(
            "{}: {}/{} replicas ready",
            status.phase, status.ready_replicas, dc.spec.replicas
        ));
        Ok(())
    }

    async fn reconcile_cql(
        &self,
        dc: &DataCenter,
        status: &mut DataCenterStatus,
        authenticated: bool,
    ) -> Result<()> {
        let mut handler = SessionHandler::new(self.connector.clone(), self.default_password.clone());
        let roles = self.roles.roles(dc);
        let session = match handler.get_session(dc, status, &roles).await {
            Ok(session) => session,
            Err(e) if e.is_connectivity() => {
                // Recorded in the CQL status, retried on the next pass
                warn!("CQL session unavailable: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.keyspaces.reconcile(session.as_ref(), dc, status).await?;
        if authenticated {
            self.roles.reconcile(&mut handler, dc, status).await?;
        }
        handler.close();
        Ok(())
    }

    /// Tear down the CQL state of a deleted datacenter.
    ///
    /// Best effort: the datacenter is removed from the replication of its
    /// keyspaces when a session can be opened, plugins are deleted and the
    /// in-memory maps forgotten in every case.
    #[instrument(skip_all, fields(datacenter = %dc.datacenter_key()))]
    pub async fn remove_datacenter(&self, dc: &DataCenter) -> DataCenterStatus {
        let mut status = dc.status.clone().unwrap_or_default();
        let authenticated = dc.spec.authentication != Authentication::None;

        if authenticated {
            self.roles.ensure_builtin_roles(dc);
            if let Err(e) = self.roles.load_passwords(dc).await {
                warn!("Failed to load role passwords: {}", e);
            }
        }

        let mut handler = SessionHandler::new(self.connector.clone(), self.default_password.clone());
        let roles = self.roles.roles(dc);
        match handler.get_session(dc, &mut status, &roles).await {
            Ok(session) => {
                self.keyspaces.remove_datacenter(session.as_ref(), dc).await;
                handler.close();
            }
            Err(e) => {
                warn!("No CQL session, replication left unchanged: {}", e);
                self.keyspaces.manager().remove_datacenter(&dc.datacenter_key());
            }
        }

        self.plugins.delete_all(dc, &mut status).await;
        self.roles.remove_datacenter(dc);
        info!("Datacenter removed");
        status
    }
}
