//! Executor for OCI connectors (`oci_sigv1` and `oci_genai`).
//!
//! The auth provider is built once, from the descriptor resolved when the
//! connector was loaded. Each call carries its own target URL, so
//! concurrent calls to different endpoints never share request state.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ml_connector_core::auth::OciAuthConfig;
use ml_connector_core::connector::{ActionType, Connector};
use ml_connector_core::Result;
use tracing::info;

use super::{ConnectorExecutor, Dispatcher, ExecutorOptions, Response};
use crate::signing::OciRequestSigner;

pub struct OciExecutor {
    dispatcher: Dispatcher,
    signer: Arc<OciRequestSigner>,
}

impl OciExecutor {
    pub fn new(connector: Arc<Connector>, options: &ExecutorOptions) -> Result<Self> {
        let auth = match connector.oci_auth() {
            Some(auth) => auth.clone(),
            None => OciAuthConfig::from_parameters(&connector.parameters)?,
        };
        let provider = options.oci_auth.build(&auth);
        info!(
            connector = %connector.name,
            auth_type = %provider.auth_type(),
            "creating oci executor"
        );
        Ok(Self {
            dispatcher: Dispatcher::new(connector, options)?,
            signer: Arc::new(OciRequestSigner::new(provider)),
        })
    }
}

#[async_trait]
impl ConnectorExecutor for OciExecutor {
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
