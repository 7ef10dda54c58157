//! Executor for plain HTTP connectors. Authentication, if any, comes from
//! the connector's header templates.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ml_connector_core::connector::{ActionType, Connector};
use ml_connector_core::Result;
use tracing::info;

use super::{ConnectorExecutor, Dispatcher, ExecutorOptions, Response};
use crate::signing::NoopSigner;

pub struct HttpExecutor {
    dispatcher: Dispatcher,
}

impl HttpExecutor {
    pub fn new(connector: Arc<Connector>, options: &ExecutorOptions) -> Result<Self> {
        info!(connector = %connector.name, "creating http executor");
        Ok(Self {
            dispatcher: Dispatcher::new(connector, options)?,
        })
    }
}

#[async_trait]
impl ConnectorExecutor for HttpExecutor {
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
            .dispatch(Arc::new(NoopSigner), action_type, endpoint, method, params, payload)
            .await
    }
}
