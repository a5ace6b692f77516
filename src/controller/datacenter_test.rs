//! Tests for the datacenter reconciliation pass

use std::sync::Arc;

use super::conditions::{
    find_condition, is_condition_true, CONDITION_TYPE_DEGRADED, CONDITION_TYPE_READY,
};
use super::datacenter::DataCenterReconciler;
use crate::cql::{KeyspaceReconciler, ResourceManager, RoleReconciler};
use crate::crd::{
    Authentication, CqlStatus, CredentialsStatus, DataCenter, DataCenterPhase, KeyspaceSpec,
};
use crate::plugins::{ManagedPlugin, PluginRegistry};
use crate::test_support::{datacenter, replication, statefulset, FakeConnector, FakeSecrets};

fn secrets() -> Arc<FakeSecrets> {
    let secrets = FakeSecrets::default();
    secrets.put(
        "db",
        "elassandra-cl1",
        &[
            ("cassandra.cassandra_password", "cassandra-secret"),
            ("cassandra.admin_password", "admin-secret"),
            ("cassandra.strapkop_password", "operator-secret"),
        ],
    );
    Arc::new(secrets)
}

fn reconciler(connector: &Arc<FakeConnector>, secrets: &Arc<FakeSecrets>) -> DataCenterReconciler {
    DataCenterReconciler::new(
        connector.clone(),
        "cassandra",
        KeyspaceReconciler::default(),
        RoleReconciler::new(ResourceManager::new(), secrets.clone()),
        PluginRegistry::new(vec![Arc::new(ManagedPlugin)]),
    )
}

fn with_app_keyspace(mut dc: DataCenter) -> DataCenter {
    dc.spec.keyspaces.push(KeyspaceSpec {
        name: "app".to_string(),
        rf: 3,
    });
    dc
}

#[tokio::test]
async fn test_not_ready_datacenter_skips_cql() {
    let connector = Arc::new(FakeConnector::default());
    let secrets = secrets();
    let dc = datacenter("cl1", "dc1");

    let status = reconciler(&connector, &secrets).reconcile(&dc, &[]).await;

    assert_eq!(status.phase, DataCenterPhase::Creating);
    assert_eq!(connector.attempts(), 0);
    assert_eq!(status.observed_generation, Some(1));
    assert!(!is_condition_true(&status.conditions, CONDITION_TYPE_READY));
}

#[tokio::test]
async fn test_first_pass_creates_keyspaces_then_roles() {
    let connector = Arc::new(FakeConnector::default());
    let secrets = secrets();
    let reconciler = reconciler(&connector, &secrets);
    let mut dc = with_app_keyspace(datacenter("cl1", "dc1"));
    let sets = [statefulset("cl1", "dc1", "r1", 3, 3)];

    let status = reconciler.reconcile(&dc, &sets).await;

    assert_eq!(status.phase, DataCenterPhase::Running);
    assert!(status.bootstrapped);
    assert_eq!(status.cql_status, CqlStatus::Established);
    assert_eq!(status.credentials_status, CredentialsStatus::Default);
    assert!(status.keyspaces_created.contains("app"));
    assert_eq!(status.keyspace_replicas_observed, Some(3));
    assert!(status.active_plugins.contains("managed"));
    assert!(is_condition_true(&status.conditions, CONDITION_TYPE_READY));

    let statements = connector.statements();
    let create_keyspace = statements
        .iter()
        .position(|s| {
            s == "CREATE KEYSPACE IF NOT EXISTS app WITH replication = \
                  {'class': 'NetworkTopologyStrategy', 'dc1': '3'}"
        })
        .unwrap();
    let create_operator = statements
        .iter()
        .position(|s| s.starts_with("CREATE ROLE IF NOT EXISTS strapkop WITH SUPERUSER = true"))
        .unwrap();
    assert!(create_keyspace < create_operator);

    // The operator role now exists, the next pass connects with it
    dc.status = Some(status);
    let status = reconciler.reconcile(&dc, &sets).await;
    assert_eq!(status.credentials_status, CredentialsStatus::Operator);
    let creates = connector
        .statements()
        .iter()
        .filter(|s| s.starts_with("CREATE ROLE"))
        .count();
    assert_eq!(creates, 3);
}

#[tokio::test]
async fn test_authentication_none_skips_roles() {
    let connector = Arc::new(FakeConnector::default());
    let secrets = secrets();
    let mut dc = with_app_keyspace(datacenter("cl1", "dc1"));
    dc.spec.authentication = Authentication::None;
    let sets = [statefulset("cl1", "dc1", "r1", 3, 3)];

    let status = reconciler(&connector, &secrets).reconcile(&dc, &sets).await;

    assert_eq!(status.credentials_status, CredentialsStatus::Anonymous);
    assert_eq!(secrets.reads(), 0);
    assert!(connector
        .statements()
        .iter()
        .all(|s| !s.starts_with("CREATE ROLE")));
    assert!(status.keyspaces_created.contains("app"));
}

#[tokio::test]
async fn test_invalid_spec_is_reported() {
    let connector = Arc::new(FakeConnector::default());
    let secrets = secrets();
    let mut dc = datacenter("cl1", "dc1");
    dc.spec.keyspaces.push(KeyspaceSpec {
        name: "bad;name".to_string(),
        rf: 3,
    });
    let sets = [statefulset("cl1", "dc1", "r1", 3, 3)];

    let status = reconciler(&connector, &secrets).reconcile(&dc, &sets).await;

    assert_eq!(status.phase, DataCenterPhase::Error);
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("spec.keyspaces[0].name")));
    assert_eq!(connector.attempts(), 0);
    assert!(is_condition_true(&status.conditions, CONDITION_TYPE_DEGRADED));
}

#[tokio::test]
async fn test_unreachable_cluster_is_recoverable() {
    let connector = Arc::new(FakeConnector::accepting(&["something-else"]));
    let secrets = secrets();
    let dc = datacenter("cl1", "dc1");
    let sets = [statefulset("cl1", "dc1", "r1", 3, 3)];

    let status = reconciler(&connector, &secrets).reconcile(&dc, &sets).await;

    assert_eq!(status.phase, DataCenterPhase::Running);
    assert_eq!(status.cql_status, CqlStatus::Errored);
    assert!(status.last_error.is_none());
    assert!(connector.statements().is_empty());
    let degraded = find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).unwrap();
    assert_eq!(degraded.reason, "CqlUnavailable");
}

#[tokio::test]
async fn test_remove_datacenter_drops_replication() {
    let connector = Arc::new(FakeConnector::default());
    let secrets = secrets();
    let reconciler = reconciler(&connector, &secrets);
    let dc = with_app_keyspace(datacenter("cl1", "dc1"));
    let sets = [statefulset("cl1", "dc1", "r1", 3, 3)];
    reconciler.reconcile(&dc, &sets).await;

    connector.session().set_replication(
        "system_auth",
        replication(&[
            ("class", "org.apache.cassandra.locator.NetworkTopologyStrategy"),
            ("dc1", "3"),
            ("dc2", "3"),
        ]),
    );
    reconciler.remove_datacenter(&dc).await;

    assert!(connector.statements().contains(
        &"ALTER KEYSPACE system_auth WITH replication = \
          {'class': 'NetworkTopologyStrategy', 'dc2': '3'}"
            .to_string()
    ));
    assert!(reconciler
        .keyspaces()
        .manager()
        .list(&dc.datacenter_key())
        .is_empty());
    assert!(reconciler.roles().roles(&dc).is_empty());
}
