//! Connector definitions and template rendering.
//!
//! A [`Connector`] is a declarative description of a remote model endpoint:
//! which protocol to speak, which parameters and credentials it owns, and one
//! [`ConnectorAction`] per supported [`ActionType`]. Connectors are loaded from
//! JSON documents and are immutable afterwards.
//!
//! Rendering functions are pure: the same connector and parameter map always
//! produce the same endpoint, method, payload, and headers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::auth::{AwsCredentials, OciAuthConfig};
use crate::error::{Error, Result};
use crate::protocol::ConnectorProtocol;
use crate::template::{self, CREDENTIAL_NAMESPACE, PARAMETERS_NAMESPACE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Predict,
    Download,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Predict => f.write_str("PREDICT"),
            ActionType::Download => f.write_str("DOWNLOAD"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Private,
    Public,
    Restricted,
}

/// One remote operation a connector can perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorAction {
    pub action_type: ActionType,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    /// Lua source turning input documents into request parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_process_function: Option<String>,
    /// Lua source turning a parsed response into output tensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process_function: Option<String>,
}

/// Resolves stored credential values into their plaintext form.
///
/// Called on every header render; implementations must not cache plaintext
/// on the connector.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, value: &str) -> Result<String>;
}

/// Decryptor for credentials that are already stored in plaintext.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCredentials;

impl CredentialDecryptor for PlaintextCredentials {
    fn decrypt(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub protocol: ConnectorProtocol,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub credential: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: Vec<ConnectorAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub access_mode: AccessMode,

    #[serde(skip)]
    oci_auth: Option<OciAuthConfig>,
}

impl Connector {
    /// Parse and validate a connector document.
    pub fn from_json(json: &str) -> Result<Self> {
        let connector: Connector = serde_json::from_str(json)
            .map_err(|e| Error::invalid_config(format!("invalid connector document: {e}")))?;
        connector.validated()
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let connector: Connector = serde_json::from_value(value)
            .map_err(|e| Error::invalid_config(format!("invalid connector document: {e}")))?;
        connector.validated()
    }

    /// Protocol-specific load-time checks.
    ///
    /// OCI connectors resolve their auth descriptor here; AWS connectors must
    /// carry a complete credential set.
    fn validated(mut self) -> Result<Self> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("connector name must not be empty"));
        }
        match self.protocol {
            ConnectorProtocol::Http => {}
            ConnectorProtocol::AwsSigV4 => {
                AwsCredentials::from_connector(&self)?;
            }
            ConnectorProtocol::OciSigV1 | ConnectorProtocol::OciGenai => {
                self.oci_auth = Some(OciAuthConfig::from_parameters(&self.parameters)?);
            }
        }
        Ok(self)
    }

    /// The OCI auth descriptor resolved at load time, for OCI connectors.
    pub fn oci_auth(&self) -> Option<&OciAuthConfig> {
        self.oci_auth.as_ref()
    }

    /// Deep copy through a serialize/deserialize round trip.
    pub fn clone_connector(&self) -> Result<Self> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| Error::invalid_config(format!("failed to serialize connector: {e}")))?;
        let copy: Connector = serde_json::from_slice(&bytes)
            .map_err(|e| Error::invalid_config(format!("failed to deserialize connector: {e}")))?;
        copy.validated()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::invalid_config(format!("failed to serialize connector: {e}")))
    }

    pub fn action(&self, action_type: ActionType) -> Result<&ConnectorAction> {
        self.actions
            .iter()
            .find(|a| a.action_type == action_type)
            .ok_or(Error::ActionNotFound(action_type))
    }

    pub fn has_action(&self, action_type: ActionType) -> bool {
        self.actions.iter().any(|a| a.action_type == action_type)
    }

    pub fn endpoint(&self, action_type: ActionType, params: &BTreeMap<String, String>) -> Result<String> {
        template::render(&self.action(action_type)?.url, params)
    }

    pub fn http_method(&self, action_type: ActionType) -> Result<&str> {
        Ok(self.action(action_type)?.method.as_str())
    }

    /// Render the action's request body, if it declares one.
    pub fn payload(
        &self,
        action_type: ActionType,
        params: &BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        match &self.action(action_type)?.request_body {
            Some(body) => template::render(body, params).map(Some),
            None => Ok(None),
        }
    }

    /// Check that a rendered payload is well-formed JSON. Blank payloads pass.
    pub fn validate_payload(&self, payload: &str) -> Result<()> {
        if payload.trim().is_empty() {
            return Ok(());
        }
        serde_json::from_str::<serde_json::Value>(payload)
            .map(|_| ())
            .map_err(|e| Error::InvalidPayload(format!("request body is not valid JSON: {e}")))
    }

    /// Render header templates against decrypted credentials and `params`.
    pub fn decrypted_headers(
        &self,
        action_type: ActionType,
        decryptor: &dyn CredentialDecryptor,
        params: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let Some(headers) = &self.action(action_type)?.headers else {
            return Ok(BTreeMap::new());
        };
        let credential = self.decrypted_credential(decryptor)?;
        headers
            .iter()
            .map(|(name, value)| {
                let rendered = template::render_scopes(
                    value,
                    &[(CREDENTIAL_NAMESPACE, &credential), (PARAMETERS_NAMESPACE, params)],
                )?;
                Ok((name.clone(), rendered))
            })
            .collect()
    }

    pub fn decrypted_credential(
        &self,
        decryptor: &dyn CredentialDecryptor,
    ) -> Result<BTreeMap<String, String>> {
        self.credential
            .iter()
            .map(|(k, v)| Ok((k.clone(), decryptor.decrypt(v)?)))
            .collect()
    }

    pub fn predict_endpoint(&self, params: &BTreeMap<String, String>) -> Result<String> {
        self.endpoint(ActionType::Predict, params)
    }

    pub fn predict_http_method(&self) -> Result<&str> {
        self.http_method(ActionType::Predict)
    }

    pub fn create_predict_payload(&self, params: &BTreeMap<String, String>) -> Result<Option<String>> {
        self.payload(ActionType::Predict, params)
    }
}
