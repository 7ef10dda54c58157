//! Remote invocation: parameters → rendered request → executor → tensors.
//!
//! [`RemoteInvoker`] wraps any [`ConnectorExecutor`] and runs the full
//! predict pipeline:
//!
//! 1. Merge the connector's parameters with the call's (the call wins).
//! 2. For text documents, loop over the batch (see [`process_doc_batches`]).
//! 3. Turn documents into parameters, render and validate the payload,
//!    resolve endpoint and method.
//! 4. Call the executor and drain the body.
//! 5. Fail with [`Error::RemoteService`] on any status outside `200..300`.
//! 6. Map the body to tensors, through the action's post-process script if
//!    it has one, and tag them with the status code.
//!
//! Downloads run steps 1, 3, and 4 for the `DOWNLOAD` action and hand back
//! the body stream unread.

use std::collections::BTreeMap;
use std::future::Future;

use ml_connector_core::connector::{ActionType, ConnectorAction};
use ml_connector_core::input::MlInput;
use ml_connector_core::tensor::{ModelTensor, ModelTensorOutput, ModelTensors, RESPONSE_TENSOR_NAME};
use ml_connector_core::{Error, Result};
use tracing::{debug, instrument, warn};

use crate::executor::{ConnectorExecutor, Response};
use crate::script::ScriptEngine;

/// Parameter that carries the JSON-encoded document slice when an action
/// has no pre-process script.
pub const TEXT_DOCS_PARAMETER: &str = "texts";

pub struct RemoteInvoker<E> {
    executor: E,
    scripts: ScriptEngine,
}

impl<E: ConnectorExecutor> RemoteInvoker<E> {
    pub fn new(executor: E, scripts: ScriptEngine) -> Self {
        Self { executor, scripts }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Connector parameters overlaid with `call`.
    pub fn merged_parameters(&self, call: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut params = self.executor.connector().parameters.clone();
        params.extend(call.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }

    #[instrument(skip_all, fields(connector = %self.executor.connector().name))]
    pub async fn execute_predict(&self, input: &MlInput) -> Result<ModelTensorOutput> {
        let params = self.merged_parameters(input.parameters());
        let outputs = match input {
            MlInput::TextDocs { docs, .. } => {
                process_doc_batches(docs, |slice| self.invoke_predict(Some(slice), &params)).await?
            }
            MlInput::Remote { .. } => self.invoke_predict(None, &params).await?,
        };
        Ok(ModelTensorOutput::new(outputs))
    }

    /// One remote call. Returns the tensors it produced.
    async fn invoke_predict(
        &self,
        docs: Option<&[String]>,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<ModelTensors>> {
        let connector = self.executor.connector();
        let action = connector.action(ActionType::Predict)?;

        let mut call_params = params.clone();
        if let Some(docs) = docs {
            let doc_params = match &action.pre_process_function {
                Some(script) => self.scripts.pre_process(script, docs, params).await?,
                None => text_docs_parameters(docs)?,
            };
            call_params.extend(doc_params);
        }

        let payload = connector.create_predict_payload(&call_params)?;
        if let Some(payload) = &payload {
            connector.validate_payload(payload)?;
        }
        let endpoint = connector.predict_endpoint(&call_params)?;
        let method = connector.predict_http_method()?;

        let response = self
            .executor
            .execute_remote_call(
                ActionType::Predict,
                &endpoint,
                method,
                &call_params,
                payload.as_deref(),
            )
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !(200..300).contains(&status) {
            warn!(connector = %connector.name, status, "remote model returned an error");
            return Err(Error::RemoteService { status, body });
        }

        let tensors = self.process_output(action, &body, status, &call_params).await?;
        Ok(vec![ModelTensors::new(tensors).with_status(status)])
    }

    async fn process_output(
        &self,
        action: &ConnectorAction,
        body: &str,
        status: u16,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<ModelTensor>> {
        let parsed = serde_json::from_str::<serde_json::Value>(body);
        match (&action.post_process_function, parsed) {
            (Some(script), Ok(value)) => self.scripts.post_process(script, value, status, params).await,
            (Some(_), Err(e)) => Err(Error::InvalidResponse(format!(
                "response is not JSON, cannot run post_process: {e}"
            ))),
            (None, Ok(value)) => Ok(vec![ModelTensor::from_json(RESPONSE_TENSOR_NAME, value)]),
            (None, Err(_)) => Ok(vec![ModelTensor {
                result: Some(body.to_string()),
                ..ModelTensor::named(RESPONSE_TENSOR_NAME)
            }]),
        }
    }

    /// Run the `DOWNLOAD` action and return the response with its body
    /// still unread.
    #[instrument(skip_all, fields(connector = %self.executor.connector().name))]
    pub async fn execute_download(&self, call: &BTreeMap<String, String>) -> Result<Response> {
        let connector = self.executor.connector();
        let params = self.merged_parameters(call);

        let payload = connector.payload(ActionType::Download, &params)?;
        if let Some(payload) = &payload {
            connector.validate_payload(payload)?;
        }
        let endpoint = connector.endpoint(ActionType::Download, &params)?;
        let method = connector.http_method(ActionType::Download)?;

        let response = self
            .executor
            .execute_remote_call(ActionType::Download, &endpoint, method, &params, payload.as_deref())
            .await?;
        if response.is_success() {
            return Ok(response);
        }

        warn!(connector = %connector.name, status = response.status(), "download failed");
        Err(response.into_remote_error().await)
    }
}

fn text_docs_parameters(docs: &[String]) -> Result<BTreeMap<String, String>> {
    let texts = serde_json::to_string(docs)
        .map_err(|e| Error::InvalidPayload(format!("failed to encode documents: {e}")))?;
    Ok(BTreeMap::from([(TEXT_DOCS_PARAMETER.to_string(), texts)]))
}

/// Drive `step` over a document batch.
///
/// Each call receives every document not yet covered and reports the
/// tensors it produced. The cursor advances by the number of tensors
/// returned, and by at least one, so the loop always terminates within
/// `docs.len()` calls. Empty input makes no calls.
pub async fn process_doc_batches<'a, F, Fut>(docs: &'a [String], mut step: F) -> Result<Vec<ModelTensors>>
where
    F: FnMut(&'a [String]) -> Fut,
    Fut: Future<Output = Result<Vec<ModelTensors>>>,
{
    let mut outputs = Vec::new();
    let mut processed = 0;
    while processed < docs.len() {
        let remaining = &docs[processed..];
        let produced = step(remaining).await?;
        debug!(
            remaining = remaining.len(),
            produced = produced.len(),
            "processed document slice"
        );
        processed += produced.len().max(1);
        outputs.extend(produced);
    }
    Ok(outputs)
}
