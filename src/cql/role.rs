//! CQL role management
//!
//! Roles are declared by immutable [`RoleDescriptor`]s and instantiated per
//! datacenter into mutable [`CqlRole`]s that track the loaded password and
//! whether the role has been applied with it.
//!
//! Applying the operator's own role invalidates the current session so that
//! any further CQL work reconnects with that role.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::manager::ResourceManager;
use super::secrets::SecretProvider;
use super::session::{CqlSession, SessionHandler};
use crate::crd::{DataCenter, DataCenterStatus, RoleSpec};
use crate::error::{Error, Result};

pub const CASSANDRA_ROLE: &str = "cassandra";
pub const ADMIN_ROLE: &str = "admin";
pub const OPERATOR_ROLE: &str = "strapkop";
pub const REAPER_ROLE: &str = "reaper";

/// Characters that would break statement quoting
const FORBIDDEN_CHARS: [char; 3] = ['\'', '"', ';'];

/// Callback run once a role has been created and granted
#[async_trait]
pub trait RoleHook: Send + Sync {
    async fn after_create(
        &self,
        session: &dyn CqlSession,
        dc: &DataCenter,
        status: &mut DataCenterStatus,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct PostCreateHook(pub Arc<dyn RoleHook>);

impl fmt::Debug for PostCreateHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PostCreateHook")
    }
}

/// Where a role's password is read from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretSource {
    /// The datacenter credentials secret
    Datacenter,
    Named(String),
}

#[derive(Clone, Debug)]
pub struct RoleDescriptor {
    pub username: String,
    pub secret: SecretSource,
    pub secret_key: String,
    pub superuser: bool,
    pub login: bool,
    pub grant_statements: Vec<String>,
    pub post_create: Option<PostCreateHook>,
    /// Plugin which registered the role
    pub owner: String,
}

impl RoleDescriptor {
    pub fn new(username: impl Into<String>, owner: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            secret_key: default_secret_key(&username),
            username,
            secret: SecretSource::Datacenter,
            superuser: false,
            login: true,
            grant_statements: Vec::new(),
            post_create: None,
            owner: owner.into(),
        }
    }

    pub fn superuser(mut self, superuser: bool) -> Self {
        self.superuser = superuser;
        self
    }

    pub fn grant(mut self, statement: impl Into<String>) -> Self {
        self.grant_statements.push(statement.into());
        self
    }

    pub fn post_create(mut self, hook: Arc<dyn RoleHook>) -> Self {
        self.post_create = Some(PostCreateHook(hook));
        self
    }

    pub fn cassandra() -> Self {
        Self::new(CASSANDRA_ROLE, "core").superuser(true)
    }

    pub fn admin() -> Self {
        Self::new(ADMIN_ROLE, "core").superuser(true)
    }

    pub fn operator() -> Self {
        Self::new(OPERATOR_ROLE, "core").superuser(true)
    }

    pub fn reaper() -> Self {
        Self::new(REAPER_ROLE, "reaper")
    }

    pub fn from_spec(spec: &RoleSpec, owner: impl Into<String>) -> Self {
        let mut descriptor = Self::new(spec.username.clone(), owner).superuser(spec.superuser);
        descriptor.login = spec.login;
        descriptor.grant_statements = spec.grant_statements.clone();
        if let Some(name) = &spec.secret_name {
            descriptor.secret = SecretSource::Named(name.clone());
        }
        if let Some(key) = &spec.secret_key {
            descriptor.secret_key = key.clone();
        }
        descriptor
    }

    /// Fresh per-datacenter role, without password and not applied
    pub fn instantiate(&self) -> CqlRole {
        CqlRole {
            descriptor: self.clone(),
            password: None,
            applied: false,
        }
    }
}

pub fn default_secret_key(username: &str) -> String {
    format!("cassandra.{username}_password")
}

#[derive(Clone, Debug)]
pub struct CqlRole {
    pub descriptor: RoleDescriptor,
    pub password: Option<String>,
    /// The role exists in Cassandra with the current password
    pub applied: bool,
}

impl CqlRole {
    pub fn username(&self) -> &str {
        &self.descriptor.username
    }
}

/// Reject credentials that cannot be safely embedded in a statement.
///
/// The error message never includes the password.
pub fn validate_credentials(username: &str, password: &str) -> Result<()> {
    if username.is_empty() || username.contains(FORBIDDEN_CHARS) {
        return Err(Error::ConfigError(format!(
            "role name {username:?} contains forbidden characters"
        )));
    }
    if password.is_empty() || password.contains(FORBIDDEN_CHARS) {
        return Err(Error::ConfigError(format!(
            "password of role {username} is empty or contains forbidden characters"
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct RoleReconciler {
    roles: ResourceManager<CqlRole>,
    secrets: Arc<dyn SecretProvider>,
}

impl RoleReconciler {
    pub fn new(roles: ResourceManager<CqlRole>, secrets: Arc<dyn SecretProvider>) -> Self {
        Self { roles, secrets }
    }

    pub fn manager(&self) -> &ResourceManager<CqlRole> {
        &self.roles
    }

    pub fn roles(&self, dc: &DataCenter) -> Vec<CqlRole> {
        self.roles.list(&dc.datacenter_key())
    }

    pub fn ensure_builtin_roles(&self, dc: &DataCenter) {
        let dc_key = dc.datacenter_key();
        for descriptor in [
            RoleDescriptor::cassandra(),
            RoleDescriptor::admin(),
            RoleDescriptor::operator(),
        ] {
            self.roles
                .add_if_absent(&dc_key, &descriptor.username, || descriptor.instantiate());
        }
    }

    /// Load role passwords from their secrets, reading each secret once.
    ///
    /// A password that differs from the loaded one marks the role for
    /// re-application. A missing secret or key only affects that role.
    pub async fn load_passwords(&self, dc: &DataCenter) -> Result<()> {
        let dc_key = dc.datacenter_key();
        let namespace = dc.namespace_or_default();
        let mut secrets: HashMap<String, Option<BTreeMap<String, String>>> = HashMap::new();

        for role in self.roles.list(&dc_key) {
            let secret_name = match &role.descriptor.secret {
                SecretSource::Datacenter => dc.credentials_secret_name(),
                SecretSource::Named(name) => name.clone(),
            };
            if !secrets.contains_key(&secret_name) {
                let secret = self.secrets.get_secret(&namespace, &secret_name).await?;
                secrets.insert(secret_name.clone(), secret);
            }

            let password = secrets
                .get(&secret_name)
                .and_then(|s| s.as_ref())
                .and_then(|s| s.get(&role.descriptor.secret_key));
            let Some(password) = password else {
                warn!(
                    role = role.username(),
                    "Key {} not found in secret {}/{}",
                    role.descriptor.secret_key,
                    namespace,
                    secret_name
                );
                continue;
            };

            if role.password.as_deref() != Some(password.as_str()) {
                if role.password.is_some() {
                    info!(role = role.username(), "Password changed, role will be re-applied");
                }
                let password = password.clone();
                self.roles.update(&dc_key, role.username(), |r| {
                    r.password = Some(password);
                    r.applied = false;
                });
            }
        }
        Ok(())
    }

    /// Apply every pending role, then invalidate the session if the
    /// operator's own role was among them.
    #[instrument(skip_all, fields(datacenter = %dc.datacenter_key()))]
    pub async fn reconcile(
        &self,
        handler: &mut SessionHandler,
        dc: &DataCenter,
        status: &mut DataCenterStatus,
    ) -> Result<()> {
        let dc_key = dc.datacenter_key();
        let roles = self.roles.list(&dc_key);
        let pending: Vec<&CqlRole> = roles.iter().filter(|r| !r.applied).collect();
        if pending.is_empty() {
            debug!("All roles applied");
            return Ok(());
        }

        let session = handler.get_session(dc, status, &roles).await?;
        let mut operator_applied = false;
        for role in pending {
            match apply_role(session.as_ref(), dc, status, role).await {
                Ok(()) => {
                    info!(role = role.username(), "Role applied");
                    self.roles
                        .update(&dc_key, role.username(), |r| r.applied = true);
                    if role.username() == OPERATOR_ROLE {
                        operator_applied = true;
                    }
                }
                Err(e) => warn!(role = role.username(), "Failed to apply role: {}", e),
            }
        }

        if operator_applied {
            handler.invalidate();
        }
        Ok(())
    }

    pub fn remove_datacenter(&self, dc: &DataCenter) {
        self.roles.remove_datacenter(&dc.datacenter_key());
    }
}

async fn apply_role(
    session: &dyn CqlSession,
    dc: &DataCenter,
    status: &mut DataCenterStatus,
    role: &CqlRole,
) -> Result<()> {
    let username = role.username();
    let password = role
        .password
        .as_deref()
        .ok_or_else(|| Error::ConfigError(format!("no password loaded for role {username}")))?;
    validate_credentials(username, password)?;

    session
        .execute(&format!(
            "CREATE ROLE IF NOT EXISTS {} WITH SUPERUSER = {} AND LOGIN = {} AND PASSWORD = '{}'",
            username, role.descriptor.superuser, role.descriptor.login, password
        ))
        .await?;
    session
        .execute(&format!(
            "ALTER ROLE {username} WITH PASSWORD = '{password}'"
        ))
        .await?;
    for grant in &role.descriptor.grant_statements {
        session.execute(grant).await?;
    }
    if let Some(hook) = &role.descriptor.post_create {
        hook.0.after_create(session, dc, status).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::session::SessionState;
    use crate::crd::ReaperPhase;
    use crate::test_support::{datacenter, FakeConnector, FakeSecrets};

    fn credentials_secret() -> FakeSecrets {
        let secrets = FakeSecrets::default();
        secrets.put(
            "db",
            "elassandra-cl1",
            &[
                ("cassandra.cassandra_password", "cassandra-secret"),
                ("cassandra.admin_password", "admin-secret"),
                ("cassandra.strapkop_password", "operator-secret"),
                ("cassandra.reaper_password", "reaper-secret"),
            ],
        );
        secrets
    }

    fn alter_count(statements: &[String]) -> usize {
        statements
            .iter()
            .filter(|s| s.starts_with("ALTER ROLE"))
            .count()
    }

    #[test]
    fn test_validate_credentials() {
        assert!(validate_credentials("admin", "s3cret").is_ok());
        let err = validate_credentials("admin", "it's").unwrap_err();
        assert!(err.is_configuration());
        assert!(!err.to_string().contains("it's"));
        assert!(validate_credentials("admin", "a;b").is_err());
        assert!(validate_credentials("adm\"in", "pw").is_err());
    }

    #[test]
    fn test_instantiate_is_fresh() {
        let descriptor = RoleDescriptor::admin();
        let mut first = descriptor.instantiate();
        first.password = Some("pw".to_string());
        first.applied = true;
        let second = descriptor.instantiate();
        assert!(second.password.is_none());
        assert!(!second.applied);
        assert_eq!(second.descriptor.secret_key, "cassandra.admin_password");
    }

    #[tokio::test]
    async fn test_secret_read_once_per_pass() {
        let dc = datacenter("cl1", "dc1");
        let secrets = Arc::new(credentials_secret());
        let reconciler = RoleReconciler::new(ResourceManager::new(), secrets.clone());
        reconciler.ensure_builtin_roles(&dc);
        reconciler.load_passwords(&dc).await.unwrap();

        assert_eq!(secrets.reads(), 1);
        assert!(reconciler.roles(&dc).iter().all(|r| r.password.is_some()));
    }

    #[tokio::test]
    async fn test_roles_applied_once() {
        let dc = datacenter("cl1", "dc1");
        let mut status = DataCenterStatus::default();
        let connector = Arc::new(FakeConnector::default());
        let reconciler = RoleReconciler::new(ResourceManager::new(), Arc::new(credentials_secret()));
        reconciler.ensure_builtin_roles(&dc);

        let mut handler = SessionHandler::new(connector.clone(), "cassandra");
        reconciler.load_passwords(&dc).await.unwrap();
        reconciler.reconcile(&mut handler, &dc, &mut status).await.unwrap();
        assert_eq!(alter_count(&connector.statements()), 3);
        assert!(reconciler.roles(&dc).iter().all(|r| r.applied));

        let mut handler = SessionHandler::new(connector.clone(), "cassandra");
        reconciler.load_passwords(&dc).await.unwrap();
        reconciler.reconcile(&mut handler, &dc, &mut status).await.unwrap();
        assert_eq!(alter_count(&connector.statements()), 3);
        assert!(reconciler.roles(&dc).iter().all(|r| r.applied));
    }

    #[tokio::test]
    async fn test_password_rotation_reapplies_role() {
        let dc = datacenter("cl1", "dc1");
        let mut status = DataCenterStatus::default();
        let connector = Arc::new(FakeConnector::default());
        let secrets = Arc::new(credentials_secret());
        let reconciler = RoleReconciler::new(ResourceManager::new(), secrets.clone());
        reconciler.ensure_builtin_roles(&dc);

        let mut handler = SessionHandler::new(connector.clone(), "cassandra");
        reconciler.load_passwords(&dc).await.unwrap();
        reconciler.reconcile(&mut handler, &dc, &mut status).await.unwrap();

        secrets.put("db", "elassandra-cl1", &[("cassandra.admin_password", "rotated")]);
        let mut handler = SessionHandler::new(connector.clone(), "cassandra");
        reconciler.load_passwords(&dc).await.unwrap();
        reconciler.reconcile(&mut handler, &dc, &mut status).await.unwrap();

        assert!(connector
            .statements()
            .contains(&"ALTER ROLE admin WITH PASSWORD = 'rotated'".to_string()));
    }

    #[tokio::test]
    async fn test_operator_role_invalidates_session() {
        let dc = datacenter("cl1", "dc1");
        let mut status = DataCenterStatus::default();
        let connector = Arc::new(FakeConnector::default());
        let reconciler = RoleReconciler::new(ResourceManager::new(), Arc::new(credentials_secret()));
        reconciler.ensure_builtin_roles(&dc);
        reconciler.load_passwords(&dc).await.unwrap();

        let mut handler = SessionHandler::new(connector.clone(), "cassandra");
        let before = handler
            .get_session(&dc, &mut status, &reconciler.roles(&dc))
            .await
            .unwrap();
        reconciler.reconcile(&mut handler, &dc, &mut status).await.unwrap();
        assert_eq!(handler.state(), SessionState::NoSession);

        let after = handler
            .get_session(&dc, &mut status, &reconciler.roles(&dc))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(connector.connections(), 2);
        assert_eq!(
            status.credentials_status,
            crate::crd::CredentialsStatus::Operator
        );
    }

    #[tokio::test]
    async fn test_invalid_password_never_reaches_statement() {
        let dc = datacenter("cl1", "dc1");
        let mut status = DataCenterStatus::default();
        let connector = Arc::new(FakeConnector::default());
        let secrets = credentials_secret();
        secrets.put("db", "elassandra-cl1", &[("cassandra.admin_password", "bad'pw")]);
        let reconciler = RoleReconciler::new(ResourceManager::new(), Arc::new(secrets));
        reconciler.ensure_builtin_roles(&dc);
        reconciler.load_passwords(&dc).await.unwrap();

        let mut handler = SessionHandler::new(connector.clone(), "cassandra");
        reconciler.reconcile(&mut handler, &dc, &mut status).await.unwrap();

        assert!(connector.statements().iter().all(|s| !s.contains("bad'pw")));
        let roles = reconciler.roles(&dc);
        let admin = roles.iter().find(|r| r.username() == ADMIN_ROLE).unwrap();
        assert!(!admin.applied);
        let cassandra = roles.iter().find(|r| r.username() == CASSANDRA_ROLE).unwrap();
        assert!(cassandra.applied);
    }

    struct MarkRoleCreated;

    #[async_trait]
    impl RoleHook for MarkRoleCreated {
        async fn after_create(
            &self,
            session: &dyn CqlSession,
            _dc: &DataCenter,
            status: &mut DataCenterStatus,
        ) -> Result<()> {
            session
                .execute("GRANT ALL PERMISSIONS ON KEYSPACE reaper_db TO reaper")
                .await?;
            status.reaper_phase = ReaperPhase::RoleCreated;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_post_create_hook_runs_after_grants() {
        let dc = datacenter("cl1", "dc1");
        let mut status = DataCenterStatus::default();
        let connector = Arc::new(FakeConnector::default());
        let reconciler = RoleReconciler::new(ResourceManager::new(), Arc::new(credentials_secret()));
        let descriptor = RoleDescriptor::reaper()
            .grant("GRANT SELECT ON KEYSPACE system_auth TO reaper")
            .post_create(Arc::new(MarkRoleCreated));
        reconciler
            .manager()
            .add_if_absent(&dc.datacenter_key(), REAPER_ROLE, || descriptor.instantiate());
        reconciler.load_passwords(&dc).await.unwrap();

        let mut handler = SessionHandler::new(connector.clone(), "cassandra");
        reconciler.reconcile(&mut handler, &dc, &mut status).await.unwrap();

        let statements = connector.statements();
        let grant = statements
            .iter()
            .position(|s| s.starts_with("GRANT SELECT"))
            .unwrap();
        let hook = statements
            .iter()
            .position(|s| s.starts_with("GRANT ALL"))
            .unwrap();
        assert!(grant < hook);
        assert_eq!(status.reaper_phase, ReaperPhase::RoleCreated);
    }
}
