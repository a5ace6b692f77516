//! scylla-backed implementation of the CQL session traits

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scylla::transport::downgrading_consistency_retry_policy::DowngradingConsistencyRetryPolicy;
use scylla::{ExecutionProfile, Session, SessionBuilder};
use tracing::{debug, trace};

use super::session::{CqlConnector, CqlSession, Credentials};
use crate::error::{Error, Result};

const REPLICATION_QUERY: &str =
    "SELECT replication FROM system_schema.keyspaces WHERE keyspace_name = ?";

#[derive(Clone, Debug)]
pub struct ScyllaConnector {
    port: u16,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ScyllaConnector {
    pub fn new(port: u16, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl CqlConnector for ScyllaConnector {
    async fn connect(
        &self,
        contact_point: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn CqlSession>> {
        // Transient unavailability is absorbed by the driver at a weaker consistency
        let profile = ExecutionProfile::builder()
            .request_timeout(Some(self.request_timeout))
            .retry_policy(Box::new(DowngradingConsistencyRetryPolicy::new()))
            .build();

        let mut builder = SessionBuilder::new()
            .known_node(format!("{}:{}", contact_point, self.port))
            .connection_timeout(self.connect_timeout)
            .default_execution_profile_handle(profile.into_handle());
        if let Some(credentials) = credentials {
            builder = builder.user(&credentials.username, &credentials.password);
        }

        let session = builder.build().await.map_err(|e| {
            let message = e.to_string();
            if message.to_lowercase().contains("authentication") {
                Error::AuthenticationError {
                    role: credentials
                        .map(|c| c.username.clone())
                        .unwrap_or_else(|| "<anonymous>".to_string()),
                    message,
                }
            } else {
                Error::ConnectionError(message)
            }
        })?;

        debug!("CQL session established with {}", contact_point);
        Ok(Arc::new(ScyllaSession { session }))
    }
}

pub struct ScyllaSession {
    session: Session,
}

#[async_trait]
impl CqlSession for ScyllaSession {
    async fn execute(&self, statement: &str) -> Result<()> {
        trace!("Executing CQL: {}", statement);
        self.session
            .query(statement, ())
            .await
            .map_err(|e| Error::CqlError(e.to_string()))?;
        Ok(())
    }

    async fn keyspace_replication(
        &self,
        keyspace: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let result = self
            .session
            .query(REPLICATION_QUERY, (keyspace,))
            .await
            .map_err(|e| Error::CqlError(e.to_string()))?;
        let row = result
            .maybe_first_row_typed::<(HashMap<String, String>,)>()
            .map_err(|e| Error::CqlError(e.to_string()))?;
        Ok(row.map(|(replication,)| replication.into_iter().collect()))
    }
}
