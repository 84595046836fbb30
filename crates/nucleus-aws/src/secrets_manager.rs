use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use nucleus_core::error::{ConfigError, Result};
use nucleus_core::secrets::SecretStore;

use crate::error::AwsCliError;
use crate::process::AwsCli;

/// Secret store backed by AWS Secrets Manager (`get-secret-value`).
#[derive(Clone)]
pub struct SecretsManagerStore {
    cli: Arc<AwsCli>,
}

#[derive(Deserialize)]
struct GetSecretValueOutput {
    #[serde(rename = "SecretString")]
    secret_string: Option<String>,
}

impl SecretsManagerStore {
    pub fn new(cli: Arc<AwsCli>) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl SecretStore for SecretsManagerStore {
    async fn get_secret(&self, name: &str) -> Result<String> {
        let out: GetSecretValueOutput = self
            .cli
            .call("secretsmanager", "get-secret-value", ["--secret-id", name])
            .await
            .map_err(|e| classify(name, e))?;
        out.secret_string.ok_or_else(|| ConfigError::SecretDecode {
            name: name.to_string(),
            reason: "secret has no string value".to_string(),
        })
    }
}

fn classify(name: &str, err: AwsCliError) -> ConfigError {
    if err.is_not_found() {
        return ConfigError::SecretNotFound(name.to_string());
    }
    // A parse failure only carries a position, never the payload itself.
    ConfigError::SecretStoreUnavailable {
        name: name.to_string(),
        reason: err.to_string(),
    }
}
