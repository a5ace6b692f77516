//! CQL session lifecycle
//!
//! A [`SessionHandler`] lives for exactly one reconciliation pass. It opens
//! at most one session per pass, escalating through the known credentials,
//! and records in the datacenter status which credentials worked so the
//! next pass probes them first.
//!
//! ```text
//! NoSession -> Connecting -> Established -> Closed
//!                  |                          ^
//!                  +---- (all failed) --------+
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::role::{CqlRole, CASSANDRA_ROLE, OPERATOR_ROLE};
use crate::crd::{Authentication, CqlStatus, CredentialsStatus, DataCenter, DataCenterStatus};
use crate::error::{Error, Result};

/// Password of the `cassandra` role on a freshly bootstrapped cluster
pub const DEFAULT_CASSANDRA_PASSWORD: &str = "cassandra";

/// An established CQL session
#[async_trait]
pub trait CqlSession: Send + Sync {
    /// Execute a statement, discarding any rows
    async fn execute(&self, statement: &str) -> Result<()>;

    /// Replication options from `system_schema.keyspaces`, `None` if the keyspace does not exist
    async fn keyspace_replication(&self, keyspace: &str)
        -> Result<Option<BTreeMap<String, String>>>;
}

/// Opens sessions against a contact point
#[async_trait]
pub trait CqlConnector: Send + Sync {
    async fn connect(
        &self,
        contact_point: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn CqlSession>>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// What a successful login with these credentials means for the status
    pub kind: CredentialsStatus,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Connecting,
    Established,
    Closed,
}

pub struct SessionHandler {
    connector: Arc<dyn CqlConnector>,
    default_password: String,
    session: Option<Arc<dyn CqlSession>>,
    state: SessionState,
}

impl SessionHandler {
    pub fn new(connector: Arc<dyn CqlConnector>, default_password: impl Into<String>) -> Self {
        Self {
            connector,
            default_password: default_password.into(),
            session: None,
            state: SessionState::NoSession,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Return the memoized session, connecting on first use.
    ///
    /// On failure the status records the CQL error and the caller is
    /// expected to skip every CQL-dependent step for this pass.
    pub async fn get_session(
        &mut self,
        dc: &DataCenter,
        status: &mut DataCenterStatus,
        roles: &[CqlRole],
    ) -> Result<Arc<dyn CqlSession>> {
        if let Some(session) = &self.session {
            return Ok(Arc::clone(session));
        }

        self.state = SessionState::Connecting;
        let contact_point = dc.service_host();
        let candidates = candidate_credentials(dc, status, roles, &self.default_password);
        let mut last_error = None;

        for credentials in &candidates {
            let username = credentials
                .as_ref()
                .map(|c| c.username.as_str())
                .unwrap_or("<anonymous>");
            debug!(
                datacenter = %dc.datacenter_key(),
                role = username,
                "Opening CQL session"
            );
            match self
                .connector
                .connect(&contact_point, credentials.as_ref())
                .await
            {
                Ok(session) => {
                    let kind = credentials
                        .as_ref()
                        .map(|c| c.kind)
                        .unwrap_or(CredentialsStatus::Anonymous);
                    if status.credentials_status != kind {
                        info!(
                            datacenter = %dc.datacenter_key(),
                            "CQL credentials switched from {:?} to {:?}",
                            status.credentials_status,
                            kind
                        );
                    }
                    status.cql_status = CqlStatus::Established;
                    status.cql_status_message = None;
                    status.credentials_status = kind;
                    self.state = SessionState::Established;
                    self.session = Some(Arc::clone(&session));
                    return Ok(session);
                }
                Err(e) => {
                    debug!(
                        datacenter = %dc.datacenter_key(),
                        role = username,
                        "CQL connection attempt failed: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| Error::ConnectionError("no usable credentials".to_string()));
        warn!(
            datacenter = %dc.datacenter_key(),
            "Unable to open a CQL session: {}", error
        );
        status.cql_status = CqlStatus::Errored;
        status.cql_status_message = Some(error.to_string());
        self.state = SessionState::Closed;
        Err(error)
    }

    /// Drop the current session so the next call reconnects with fresh credentials
    pub fn invalidate(&mut self) {
        if self.session.take().is_some() {
            debug!("CQL session invalidated");
        }
        self.state = SessionState::NoSession;
    }

    pub fn close(&mut self) {
        self.session = None;
        self.state = SessionState::Closed;
    }
}

/// Credentials to try, in order.
///
/// The operator role goes first once it is known to exist, otherwise the
/// well-known default password is probed before the secret-backed ones.
pub fn candidate_credentials(
    dc: &DataCenter,
    status: &DataCenterStatus,
    roles: &[CqlRole],
    default_password: &str,
) -> Vec<Option<Credentials>> {
    if dc.spec.authentication == Authentication::None {
        return vec![None];
    }

    let role_credentials = |username: &str, kind: CredentialsStatus| {
        roles
            .iter()
            .find(|r| r.username() == username)
            .and_then(|r| {
                r.password.as_ref().map(|password| Credentials {
                    username: username.to_string(),
                    password: password.clone(),
                    kind,
                })
            })
    };

    let operator = role_credentials(OPERATOR_ROLE, CredentialsStatus::Operator);
    let cassandra = role_credentials(CASSANDRA_ROLE, CredentialsStatus::Cassandra);
    let default = Some(Credentials {
        username: CASSANDRA_ROLE.to_string(),
        password: default_password.to_string(),
        kind: CredentialsStatus::Default,
    });

    let operator_established = status.credentials_status == CredentialsStatus::Operator
        || roles
            .iter()
            .any(|r| r.username() == OPERATOR_ROLE && r.applied);

    let ordered = if operator_established {
        vec![operator, cassandra, default]
    } else if status.credentials_status == CredentialsStatus::Cassandra {
        vec![cassandra, default, operator]
    } else {
        vec![default, cassandra, operator]
    };

    ordered
        .into_iter()
        .flatten()
        .map(Some)
        .collect()
}
