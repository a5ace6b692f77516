//! In-memory fakes shared by the unit tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};

use crate::controller::phase::{CLUSTER_LABEL, DATACENTER_LABEL, RACK_LABEL};
use crate::cql::{CqlConnector, CqlSession, Credentials, SecretProvider};
use crate::crd::{
    Authentication, DataCenter, DataCenterSpec, KibanaSpec, ReaperSpec,
};
use crate::error::{Error, Result};

/// DataCenter `elassandra-<cluster>-<dc>` in namespace `db` with 3 replicas
pub fn datacenter(cluster: &str, dc: &str) -> DataCenter {
    let mut resource = DataCenter::new(
        &format!("elassandra-{cluster}-{dc}"),
        DataCenterSpec {
            cluster_name: cluster.to_string(),
            datacenter_name: dc.to_string(),
            replicas: 3,
            authentication: Authentication::Cassandra,
            parked: false,
            datacenter_group: None,
            credentials_secret: None,
            keyspaces: Vec::new(),
            roles: Vec::new(),
            reaper: ReaperSpec::default(),
            kibana: KibanaSpec::default(),
            webhook: None,
            scheduled_backups: Vec::new(),
        },
    );
    resource.metadata.namespace = Some("db".to_string());
    resource.metadata.generation = Some(1);
    resource
}

/// Rack StatefulSet of `elassandra-<cluster>-<dc>` in namespace `db`
pub fn statefulset(cluster: &str, dc: &str, rack: &str, replicas: i32, ready: i32) -> StatefulSet {
    let mut sts = StatefulSet::default();
    sts.metadata.name = Some(format!("elassandra-{cluster}-{dc}-{rack}"));
    sts.metadata.namespace = Some("db".to_string());
    sts.metadata.labels = Some(
        [
            (CLUSTER_LABEL, cluster),
            (DATACENTER_LABEL, dc),
            (RACK_LABEL, rack),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    );
    sts.status = Some(StatefulSetStatus {
        replicas,
        ready_replicas: Some(ready),
        ..Default::default()
    });
    sts
}

pub fn replication(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Default)]
struct FakeSessionState {
    statements: Mutex<Vec<String>>,
    replication: Mutex<HashMap<String, BTreeMap<String, String>>>,
    failures: Mutex<Vec<String>>,
}

/// Records executed statements; clones share state
#[derive(Clone, Default)]
pub struct FakeSession {
    state: Arc<FakeSessionState>,
}

impl FakeSession {
    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().unwrap().clone()
    }

    pub fn set_replication(&self, keyspace: &str, replication: BTreeMap<String, String>) {
        self.state
            .replication
            .lock()
            .unwrap()
            .insert(keyspace.to_string(), replication);
    }

    /// Fail every statement starting with `prefix`
    pub fn fail_on(&self, prefix: &str) {
        self.state.failures.lock().unwrap().push(prefix.to_string());
    }
}

#[async_trait]
impl CqlSession for FakeSession {
    async fn execute(&self, statement: &str) -> Result<()> {
        self.state
            .statements
            .lock()
            .unwrap()
            .push(statement.to_string());
        let failing = self
            .state
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|p| statement.starts_with(p.as_str()));
        if failing {
            return Err(Error::CqlError(format!("rejected: {statement}")));
        }
        Ok(())
    }

    async fn keyspace_replication(
        &self,
        keyspace: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.state.replication.lock().unwrap().get(keyspace).cloned())
    }
}

/// Hands out a fresh session handle per connection, all sharing one [`FakeSession`] state
#[derive(Default)]
pub struct FakeConnector {
    session: FakeSession,
    /// Accepted passwords, every credential is accepted when `None`
    accepted: Option<Vec<String>>,
    attempts: AtomicUsize,
    connections: AtomicUsize,
}

impl FakeConnector {
    pub fn accepting(passwords: &[&str]) -> Self {
        Self {
            accepted: Some(passwords.iter().map(|p| p.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn session(&self) -> FakeSession {
        self.session.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.session.statements()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CqlConnector for FakeConnector {
    async fn connect(
        &self,
        _contact_point: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn CqlSession>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let (Some(accepted), Some(credentials)) = (&self.accepted, credentials) {
            if !accepted.contains(&credentials.password) {
                return Err(Error::AuthenticationError {
                    role: credentials.username.clone(),
                    message: "Provided username and/or password are incorrect".to_string(),
                });
            }
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.session.clone()))
    }
}

#[derive(Default)]
pub struct FakeSecrets {
    secrets: Mutex<HashMap<(String, String), BTreeMap<String, String>>>,
    reads: AtomicUsize,
}

impl FakeSecrets {
    /// Insert or overwrite keys of a secret
    pub fn put(&self, namespace: &str, name: &str, entries: &[(&str, &str)]) {
        let mut secrets = self.secrets.lock().unwrap();
        let secret = secrets
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        for (k, v) in entries {
            secret.insert(k.to_string(), v.to_string());
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretProvider for FakeSecrets {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
