//! Keyspace creation and replication factor management
//!
//! Plugins register the keyspaces they need in the per-datacenter
//! [`ResourceManager`]; the reconciler creates them once, then adjusts the
//! replication factor of this datacenter as nodes join or leave. Other
//! datacenters' entries in a replication map are never modified.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument, warn};

use super::manager::ResourceManager;
use super::session::CqlSession;
use crate::crd::{DataCenter, DataCenterStatus};
use crate::error::Result;

/// Keyspaces whose replication follows the datacenter size
pub const SYSTEM_KEYSPACES: [&str; 3] = ["system_auth", "system_distributed", "system_traces"];

/// Target replication factor of the system and elastic admin keyspaces
pub const SYSTEM_KEYSPACE_RF: i32 = 3;

const NETWORK_TOPOLOGY_STRATEGY: &str = "NetworkTopologyStrategy";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CqlKeyspace {
    pub name: String,
    /// Target replication factor for this datacenter
    pub rf: i32,
    /// Name of the plugin which registered the keyspace
    pub owner: String,
}

impl CqlKeyspace {
    pub fn new(name: impl Into<String>, rf: i32, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rf,
            owner: owner.into(),
        }
    }
}

/// Replication factor to apply for this datacenter.
///
/// Grows one ahead of the ready replicas so a joining node replicates as
/// soon as it is up, without ever exceeding the desired datacenter size.
pub fn effective_rf(spec_replicas: i32, ready_replicas: i32, target_rf: i32) -> i32 {
    1.max(target_rf.min((ready_replicas + 1).min(spec_replicas)))
}

/// Replication factor used when a keyspace is first created
pub fn initial_rf(target_rf: i32, replicas: i32) -> i32 {
    1.max(target_rf.min(replicas))
}

/// Splice this datacenter's replication factor into a live replication map.
///
/// The strategy class is dropped from the result. A replication factor of 0
/// removes the datacenter entry. Entries of other datacenters are kept as is.
pub fn merge_replication(
    existing: &BTreeMap<String, String>,
    datacenter: &str,
    rf: i32,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = existing
        .iter()
        .filter(|(k, _)| k.as_str() != "class")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if rf > 0 {
        merged.insert(datacenter.to_string(), rf.to_string());
    } else {
        merged.remove(datacenter);
    }
    merged
}

/// Whether at least one datacenter keeps a replica
pub fn has_replicas(replication: &BTreeMap<String, String>) -> bool {
    replication
        .values()
        .any(|v| v.parse::<i32>().map(|rf| rf > 0).unwrap_or(false))
}

/// Keyspace name as it must appear in a statement.
///
/// Names that are not plain lowercase identifiers, such as the `_kibana`
/// index keyspaces, are double-quoted.
pub fn quote_identifier(name: &str) -> String {
    let plain = name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// CQL map literal for a NetworkTopologyStrategy replication
pub fn replication_literal(replication: &BTreeMap<String, String>) -> String {
    let mut parts = vec![format!("'class': '{NETWORK_TOPOLOGY_STRATEGY}'")];
    parts.extend(replication.iter().map(|(dc, rf)| format!("'{dc}': '{rf}'")));
    format!("{{{}}}", parts.join(", "))
}

#[derive(Clone, Default)]
pub struct KeyspaceReconciler {
    keyspaces: ResourceManager<CqlKeyspace>,
}

impl KeyspaceReconciler {
    pub fn new(keyspaces: ResourceManager<CqlKeyspace>) -> Self {
        Self { keyspaces }
    }

    pub fn manager(&self) -> &ResourceManager<CqlKeyspace> {
        &self.keyspaces
    }

    /// Create missing keyspaces, then adjust replication when the number of
    /// ready replicas changed since the last adjustment.
    #[instrument(skip_all, fields(datacenter = %dc.datacenter_key()))]
    pub async fn reconcile(
        &self,
        session: &dyn CqlSession,
        dc: &DataCenter,
        status: &mut DataCenterStatus,
    ) -> Result<()> {
        let registered = self.keyspaces.list(&dc.datacenter_key());
        let dc_name = dc.spec.datacenter_name.as_str();
        let mut failed = false;

        for keyspace in &registered {
            if status.keyspaces_created.contains(&keyspace.name) {
                continue;
            }
            let rf = initial_rf(keyspace.rf, status.replicas);
            let mut replication = BTreeMap::new();
            replication.insert(dc_name.to_string(), rf.to_string());
            let statement = format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {}",
                quote_identifier(&keyspace.name),
                replication_literal(&replication)
            );
            match session.execute(&statement).await {
                Ok(()) => {
                    info!(keyspace = %keyspace.name, rf, "Keyspace created");
                    status.keyspaces_created.insert(keyspace.name.clone());
                }
                Err(e) => {
                    warn!(keyspace = %keyspace.name, "Failed to create keyspace: {}", e);
                    failed = true;
                }
            }
        }

        if status.keyspace_replicas_observed == Some(status.ready_replicas) {
            debug!("Ready replicas unchanged, skipping replication update");
            return Ok(());
        }

        let mut targets: Vec<(String, i32)> = SYSTEM_KEYSPACES
            .iter()
            .map(|ks| (ks.to_string(), SYSTEM_KEYSPACE_RF))
            .collect();
        targets.push((dc.elastic_admin_keyspace(), SYSTEM_KEYSPACE_RF));
        targets.extend(registered.iter().map(|ks| (ks.name.clone(), ks.rf)));

        for (keyspace, target_rf) in targets {
            let rf = effective_rf(dc.spec.replicas, status.ready_replicas, target_rf);
            if let Err(e) = update_keyspace_rf(session, &keyspace, dc_name, rf).await {
                warn!(keyspace = %keyspace, "Failed to update replication: {}", e);
                failed = true;
            }
        }

        if failed {
            // Retried on the next pass
            return Ok(());
        }
        status.keyspace_replicas_observed = Some(status.ready_replicas);
        Ok(())
    }

    /// Remove this datacenter from the replication of every keyspace it manages
    #[instrument(skip_all, fields(datacenter = %dc.datacenter_key()))]
    pub async fn remove_datacenter(&self, session: &dyn CqlSession, dc: &DataCenter) {
        let dc_key = dc.datacenter_key();
        let mut keyspaces: Vec<String> = SYSTEM_KEYSPACES.iter().map(|s| s.to_string()).collect();
        keyspaces.push(dc.elastic_admin_keyspace());
        keyspaces.extend(self.keyspaces.list(&dc_key).into_iter().map(|ks| ks.name));

        for keyspace in keyspaces {
            if let Err(e) =
                update_keyspace_rf(session, &keyspace, &dc.spec.datacenter_name, 0).await
            {
                warn!(keyspace = %keyspace, "Failed to remove datacenter from replication: {}", e);
            }
        }
        self.keyspaces.remove_datacenter(&dc_key);
    }
}

/// Set this datacenter's replication factor on a keyspace, returns true if altered
pub async fn update_keyspace_rf(
    session: &dyn CqlSession,
    keyspace: &str,
    datacenter: &str,
    rf: i32,
) -> Result<bool> {
    let Some(existing) = session.keyspace_replication(keyspace).await? else {
        debug!(keyspace, "Keyspace does not exist yet");
        return Ok(false);
    };

    let class = existing.get("class").map(String::as_str).unwrap_or_default();
    if !class.ends_with(NETWORK_TOPOLOGY_STRATEGY) {
        warn!(keyspace, class, "Replication strategy is not NetworkTopologyStrategy, skipping");
        return Ok(false);
    }

    let current = existing
        .get(datacenter)
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);
    if current == rf {
        return Ok(false);
    }

    let merged = merge_replication(&existing, datacenter, rf);
    if !has_replicas(&merged) {
        warn!(keyspace, "Refusing to leave keyspace without replicas");
        return Ok(false);
    }

    session
        .execute(&format!(
            "ALTER KEYSPACE {} WITH replication = {}",
            quote_identifier(keyspace),
            replication_literal(&merged)
        ))
        .await?;
    info!(keyspace, from = current, to = rf, "Replication factor updated");

    if rf > current {
        info!(keyspace, "Replication increased, a repair is recommended");
    } else if rf < current {
        info!(keyspace, "Replication decreased, a cleanup is recommended");
    }
    Ok(true)
}
