//! Read-only access to Kubernetes secrets holding role passwords

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Decoded key/value pairs of a secret, `None` if the secret does not exist
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;
}

pub struct KubeSecretProvider {
    client: Client,
}

impl KubeSecretProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretProvider for KubeSecretProvider {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            debug!("Secret {}/{} not found", namespace, name);
            return Ok(None);
        };

        let mut values = BTreeMap::new();
        for (key, bytes) in secret.data.unwrap_or_default() {
            let value = String::from_utf8(bytes.0).map_err(|_| {
                Error::ConfigError(format!(
                    "Secret {namespace}/{name} key {key} is not valid UTF-8"
                ))
            })?;
            values.insert(key, value);
        }
        values.extend(secret.string_data.unwrap_or_default());
        Ok(Some(values))
    }
}
