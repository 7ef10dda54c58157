//! Executor for connectors signed with AWS SigV4.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ml_connector_core::auth::AwsCredentials;
use ml_connector_core::connector::{ActionType, Connector};
use ml_connector_core::Result;
use tracing::info;

use super::{ConnectorExecutor, Dispatcher, ExecutorOptions, Response};
use crate::signing::SigV4Signer;

pub struct AwsExecutor {
    dispatcher: Dispatcher,
    signer: Arc<SigV4Signer>,
}

impl AwsExecutor {
    /// Credentials are decrypted once here; the signer keeps them for the
    /// executor's lifetime.
    pub fn new(connector: Arc<Connector>, options: &ExecutorOptions) -> Result<Self> {
        let mut credentials = AwsCredentials::from_connector(&connector)?;
        credentials.access_key = options.decryptor.decrypt(&credentials.access_key)?;
        credentials.secret_key = options.decryptor.decrypt(&credentials.secret_key)?;
        credentials.session_token = credentials
            .session_token
            .map(|token| options.decryptor.decrypt(&token))
            .transpose()?;

        info!(
            connector = %connector.name,
            region = %credentials.region,
            service = %credentials.service_name,
            "creating aws sigv4 executor"
        );
        Ok(Self {
            dispatcher: Dispatcher::new(connector, options)?,
            signer: Arc::new(SigV4Signer::new(credentials)),
        })
    }
}

#[async_trait]
impl ConnectorExecutor for AwsExecutor {
    fn connector(&self) -> &Connector {
        &self.dispatcher.connector
    }

    async fn execute_remote_call(
        &self,
        action_type: ActionType,
        endpoint: &str,
        method: &str,
        params: &BTreeMap<String, String>,
        payload: Option<&str>,
    ) -> Result<Response> {
        self.dispatcher
            .dispatch(self.signer.clone(), action_type, endpoint, method, params, payload)
            .await
    }
}
