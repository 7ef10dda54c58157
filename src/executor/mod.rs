//! Connector executors: turn a rendered endpoint, method, and payload into
//! an authenticated HTTP call.
//!
//! Each protocol has its own executor type; [`Executor`] is the closed enum
//! over them that callers normally hold. Executors never interpret the
//! status code. They return a [`Response`] for anything the server answers,
//! and only fail on validation errors (before I/O) or transport failures.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ml_connector::executor::{ConnectorExecutor, Executor, ExecutorOptions};
//! use ml_connector_core::connector::{ActionType, Connector};
//!
//! # async fn run() -> ml_connector_core::Result<()> {
//! let connector = Arc::new(Connector::from_json(r#"{
//!     "name": "echo", "protocol": "http",
//!     "actions": [{"action_type": "PREDICT", "method": "GET", "url": "https://example.com"}]
//! }"#)?);
//! let executor = Executor::for_connector(connector, &ExecutorOptions::default())?;
//! let response = executor
//!     .execute_remote_call(ActionType::Predict, "https://example.com", "GET", &Default::default(), None)
//!     .await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod aws;
pub mod http;
pub mod oci;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use ml_connector_core::connector::{ActionType, Connector, CredentialDecryptor, PlaintextCredentials};
use ml_connector_core::protocol::ConnectorProtocol;
use ml_connector_core::{Error, Result};
use tracing::{debug, error};

use crate::config::HttpConfig;
use crate::signing::{HttpMethod, OciAuthProviderFactory, OutboundRequest, RequestSigner};

pub use aws::AwsExecutor;
pub use http::HttpExecutor;
pub use oci::OciExecutor;

/// Headers that carry a provider-side request id, checked in order.
const REQUEST_ID_HEADERS: [&str; 3] = ["opc-request-id", "x-amzn-requestid", "x-request-id"];

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Status, optional provider request id, and a body that can be read once.
pub struct Response {
    status: u16,
    request_id: Option<String>,
    body: BodyStream,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl Response {
    /// In-memory response, mostly for executors that do not touch the network.
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            request_id: None,
            body: Box::pin(futures::stream::once(async move { Ok(body) })),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub(crate) fn from_reqwest(response: reqwest::Response, connector: &str, endpoint: &str) -> Self {
        let status = response.status().as_u16();
        let request_id = REQUEST_ID_HEADERS.iter().find_map(|name| {
            response
                .headers()
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
        let connector = connector.to_string();
        let endpoint = endpoint.to_string();
        let body = response.bytes_stream().map_err(move |e| Error::Transport {
            connector: connector.clone(),
            endpoint: endpoint.clone(),
            message: format!("failed to read response body: {e}"),
        });
        Self {
            status,
            request_id,
            body: Box::pin(body),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn into_stream(self) -> BodyStream {
        self.body
    }

    pub async fn bytes(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Drain the body as UTF-8, replacing invalid sequences.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Drain a failed response into [`Error::RemoteService`]. The provider
    /// request id, when present, is appended to the body.
    pub async fn into_remote_error(self) -> Error {
        let status = self.status;
        let request_id = self.request_id.clone();
        let mut body = match self.text().await {
            Ok(body) => body,
            Err(e) => return e,
        };
        if let Some(id) = request_id {
            body.push_str(&format!(" request id: {id}"));
        }
        Error::RemoteService { status, body }
    }
}

/// Performs one authenticated remote call for a connector.
#[async_trait]
pub trait ConnectorExecutor: Send + Sync {
    fn connector(&self) -> &Connector;

    /// Send `payload` to `endpoint` with `method`, applying the headers of
    /// `action_type` rendered against `params`.
    async fn execute_remote_call(
        &self,
        action_type: ActionType,
        endpoint: &str,
        method: &str,
        params: &BTreeMap<String, String>,
        payload: Option<&str>,
    ) -> Result<Response>;
}

/// Shared construction settings for executors.
#[derive(Clone)]
pub struct ExecutorOptions {
    pub http: HttpConfig,
    pub decryptor: Arc<dyn CredentialDecryptor>,
    pub oci_auth: OciAuthProviderFactory,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            decryptor: Arc::new(PlaintextCredentials),
            oci_auth: OciAuthProviderFactory::default(),
        }
    }
}

impl ExecutorOptions {
    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn CredentialDecryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn with_oci_auth(mut self, factory: OciAuthProviderFactory) -> Self {
        self.oci_auth = factory;
        self
    }
}

/// Executor for any supported protocol.
pub enum Executor {
    Http(HttpExecutor),
    AwsSigV4(AwsExecutor),
    Oci(OciExecutor),
}

impl Executor {
    pub fn for_connector(connector: Arc<Connector>, options: &ExecutorOptions) -> Result<Self> {
        Ok(match connector.protocol {
            ConnectorProtocol::Http => Executor::Http(HttpExecutor::new(connector, options)?),
            ConnectorProtocol::AwsSigV4 => Executor::AwsSigV4(AwsExecutor::new(connector, options)?),
            ConnectorProtocol::OciSigV1 | ConnectorProtocol::OciGenai => {
                Executor::Oci(OciExecutor::new(connector, options)?)
            }
        })
    }

    fn inner(&self) -> &dyn ConnectorExecutor {
        match self {
            Executor::Http(e) => e,
            Executor::AwsSigV4(e) => e,
            Executor::Oci(e) => e,
        }
    }
}

#[async_trait]
impl ConnectorExecutor for Executor {
    fn connector(&self) -> &Connector {
        self.inner().connector()
    }

    async fn execute_remote_call(
        &self,
        action_type: ActionType,
        endpoint: &str,
        method: &str,
        params: &BTreeMap<String, String>,
        payload: Option<&str>,
    ) -> Result<Response> {
        self.inner()
            .execute_remote_call(action_type, endpoint, method, params, payload)
            .await
    }
}

/// The request pipeline shared by every executor.
pub(crate) struct Dispatcher {
    pub(crate) connector: Arc<Connector>,
    pub(crate) client: reqwest::Client,
    pub(crate) decryptor: Arc<dyn CredentialDecryptor>,
}

impl Dispatcher {
    pub(crate) fn new(connector: Arc<Connector>, options: &ExecutorOptions) -> Result<Self> {
        Ok(Self {
            connector,
            client: options.http.build_client()?,
            decryptor: Arc::clone(&options.decryptor),
        })
    }

    pub(crate) async fn dispatch(
        &self,
        signer: Arc<dyn RequestSigner>,
        action_type: ActionType,
        endpoint: &str,
        method: &str,
        params: &BTreeMap<String, String>,
        payload: Option<&str>,
    ) -> Result<Response> {
        method.parse::<HttpMethod>()?;
        let headers = self
            .connector
            .decrypted_headers(action_type, self.decryptor.as_ref(), params)?;
        let signed = OutboundRequest::new(method, endpoint, &headers, payload)?
            .sign_async(signer)
            .await?;

        debug!(
            connector = %self.connector.name,
            protocol = %self.connector.protocol,
            method = %signed.request().method(),
            endpoint,
            "sending remote request"
        );

        let response = signed.send(&self.client).await.map_err(|e| {
            error!(connector = %self.connector.name, endpoint, error = %e, "remote request failed");
            Error::Transport {
                connector: self.connector.name.clone(),
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
        })?;

        debug!(
            connector = %self.connector.name,
            status = response.status().as_u16(),
            "remote request completed"
        );
        Ok(Response::from_reqwest(response, &self.connector.name, endpoint))
    }
}
