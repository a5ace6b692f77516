//! CQL-side reconciliation: sessions, keyspaces and roles
//!
//! Every component here only runs while the datacenter phase is ready and
//! talks to Cassandra through the [`CqlSession`] trait.

pub mod driver;
pub mod keyspace;
pub mod manager;
pub mod role;
pub mod secrets;
pub mod session;

pub use driver::ScyllaConnector;
pub use keyspace::{effective_rf, merge_replication, CqlKeyspace, KeyspaceReconciler};
pub use manager::ResourceManager;
pub use role::{
    CqlRole, RoleDescriptor, RoleHook, RoleReconciler, ADMIN_ROLE, CASSANDRA_ROLE, OPERATOR_ROLE,
    REAPER_ROLE,
};
pub use secrets::{KubeSecretProvider, SecretProvider};
pub use session::{
    CqlConnector, CqlSession, Credentials, SessionHandler, SessionState,
    DEFAULT_CASSANDRA_PASSWORD,
};
