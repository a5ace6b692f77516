//! Per-pod maintenance operations through the node agent sidecar

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::http::HttpClient;

pub const NODE_AGENT_PORT: u16 = 8080;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeOperation {
    Cleanup { keyspace: Option<String> },
    Repair { keyspace: Option<String> },
    Rebuild { src_dc_name: String },
    Decommission,
    Backup { target: String, snapshot_tag: String },
}

impl fmt::Display for NodeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeOperation::Cleanup { .. } => "cleanup",
            NodeOperation::Repair { .. } => "repair",
            NodeOperation::Rebuild { .. } => "rebuild",
            NodeOperation::Decommission => "decommission",
            NodeOperation::Backup { .. } => "backup",
        };
        write!(f, "{s}")
    }
}

#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Run `operation` on the node reachable at `host`, returns once it completed
    async fn execute(&self, host: &str, operation: &NodeOperation) -> Result<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupRequest<'a> {
    target: &'a str,
    snapshot_tag: &'a str,
}

/// [`NodeAgent`] talking HTTP to the sidecar container of each pod
pub struct HttpNodeAgent {
    client: HttpClient,
    port: u16,
}

impl HttpNodeAgent {
    pub fn new(client: HttpClient, port: u16) -> Self {
        Self { client, port }
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.port, path)
    }
}

fn keyspace_query(keyspace: &Option<String>) -> String {
    keyspace
        .as_ref()
        .map(|ks| format!("?keyspace={ks}"))
        .unwrap_or_default()
}

#[async_trait]
impl NodeAgent for HttpNodeAgent {
    async fn execute(&self, host: &str, operation: &NodeOperation) -> Result<()> {
        info!(host, operation = %operation, "Running node operation");
        match operation {
            NodeOperation::Cleanup { keyspace } => {
                let path = format!("/operations/cleanup{}", keyspace_query(keyspace));
                self.client.post(&self.url(host, &path)).await?;
            }
            NodeOperation::Repair { keyspace } => {
                let path = format!("/operations/repair{}", keyspace_query(keyspace));
                self.client.post(&self.url(host, &path)).await?;
            }
            NodeOperation::Rebuild { src_dc_name } => {
                let path = format!("/operations/rebuild?srcDcName={src_dc_name}");
                self.client.post(&self.url(host, &path)).await?;
            }
            NodeOperation::Decommission => {
                self.client
                    .post(&self.url(host, "/operations/decommission"))
                    .await?;
            }
            NodeOperation::Backup {
                target,
                snapshot_tag,
            } => {
                let body = BackupRequest {
                    target,
                    snapshot_tag,
                };
                self.client
                    .post_json(&self.url(host, "/backups"), &body)
                    .await?;
            }
        }
        Ok(())
    }
}
