//! Credential and auth descriptors.
//!
//! Raw connector parameter maps are turned into typed descriptors once,
//! when a connector is loaded. Executors and signers only ever see the
//! typed form.
//!
//! # OCI
//!
//! OCI connectors carry their auth settings in `parameters`:
//!
//! | key            | required for         |
//! |----------------|----------------------|
//! | `auth_type`    | always               |
//! | `tenant_id`    | `USER_PRINCIPAL`     |
//! | `user_id`      | `USER_PRINCIPAL`     |
//! | `fingerprint`  | `USER_PRINCIPAL`     |
//! | `pemfile_path` | `USER_PRINCIPAL`     |
//! | `region`       | `USER_PRINCIPAL`     |
//!
//! `auth_type` is matched case-insensitively. Keys not listed are ignored.
//!
//! # AWS
//!
//! SigV4 connectors read `access_key`, `secret_key`, and the optional
//! `session_token` from `credential`, and `region` / `service_name` from
//! `parameters`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::connector::Connector;
use crate::error::{Error, Result};

pub const AUTH_TYPE_FIELD: &str = "auth_type";
pub const TENANT_ID_FIELD: &str = "tenant_id";
pub const USER_ID_FIELD: &str = "user_id";
pub const FINGERPRINT_FIELD: &str = "fingerprint";
pub const PEMFILE_PATH_FIELD: &str = "pemfile_path";
pub const REGION_FIELD: &str = "region";

pub const ACCESS_KEY_FIELD: &str = "access_key";
pub const SECRET_KEY_FIELD: &str = "secret_key";
pub const SESSION_TOKEN_FIELD: &str = "session_token";
pub const SERVICE_NAME_FIELD: &str = "service_name";

/// OCI authentication schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciAuthType {
    ResourcePrincipal,
    InstancePrincipal,
    UserPrincipal,
}

impl OciAuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OciAuthType::ResourcePrincipal => "RESOURCE_PRINCIPAL",
            OciAuthType::InstancePrincipal => "INSTANCE_PRINCIPAL",
            OciAuthType::UserPrincipal => "USER_PRINCIPAL",
        }
    }
}

impl fmt::Display for OciAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OciAuthType {
    type Err = Error;

    /// Case-insensitive parse. Unknown values produce
    /// [`Error::UnsupportedAuthType`]; the connection-parameter validator
    /// reports them as `Wrong OCI client auth type` instead.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RESOURCE_PRINCIPAL" => Ok(OciAuthType::ResourcePrincipal),
            "INSTANCE_PRINCIPAL" => Ok(OciAuthType::InstancePrincipal),
            "USER_PRINCIPAL" => Ok(OciAuthType::UserPrincipal),
            _ => Err(Error::UnsupportedAuthType(s.to_string())),
        }
    }
}

/// Settings for signing as an explicit OCI user with an API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPrincipalConfig {
    pub tenant_id: String,
    pub user_id: String,
    pub region: String,
    pub fingerprint: String,
    pub pemfile_path: String,
}

impl UserPrincipalConfig {
    /// `{tenancy}/{user}/{fingerprint}`, the key id OCI expects in signatures.
    pub fn key_id(&self) -> String {
        format!("{}/{}/{}", self.tenant_id, self.user_id, self.fingerprint)
    }
}

/// Validated OCI auth descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciAuthConfig {
    ResourcePrincipal,
    InstancePrincipal,
    UserPrincipal(UserPrincipalConfig),
}

impl OciAuthConfig {
    /// Validate `parameters` and build the descriptor.
    pub fn from_parameters(parameters: &BTreeMap<String, String>) -> Result<Self> {
        validate_connection_parameters(Some(parameters))?;
        let auth_type = parse_auth_type(parameters)?;
        Ok(match auth_type {
            OciAuthType::ResourcePrincipal => OciAuthConfig::ResourcePrincipal,
            OciAuthType::InstancePrincipal => OciAuthConfig::InstancePrincipal,
            OciAuthType::UserPrincipal => {
                let field = |key: &str| parameters.get(key).cloned().unwrap_or_default();
                OciAuthConfig::UserPrincipal(UserPrincipalConfig {
                    tenant_id: field(TENANT_ID_FIELD),
                    user_id: field(USER_ID_FIELD),
                    region: field(REGION_FIELD),
                    fingerprint: field(FINGERPRINT_FIELD),
                    pemfile_path: field(PEMFILE_PATH_FIELD),
                })
            }
        })
    }

    pub fn auth_type(&self) -> OciAuthType {
        match self {
            OciAuthConfig::ResourcePrincipal => OciAuthType::ResourcePrincipal,
            OciAuthConfig::InstancePrincipal => OciAuthType::InstancePrincipal,
            OciAuthConfig::UserPrincipal(_) => OciAuthType::UserPrincipal,
        }
    }
}

/// Check that `parameters` can build an OCI client.
///
/// Fails with [`Error::InvalidConfig`] carrying one of:
/// `Missing credential`, `Missing auth type`, `Wrong OCI client auth type`,
/// `Missing tenant id`, `Missing user id`, `Missing fingerprint`,
/// `Missing pemfile`, `Missing region`. User-principal fields are checked in
/// that order and the first missing one is reported.
pub fn validate_connection_parameters(parameters: Option<&BTreeMap<String, String>>) -> Result<()> {
    let parameters = parameters.ok_or_else(|| Error::invalid_config("Missing credential"))?;
    let auth_type = parse_auth_type(parameters)?;

    if auth_type == OciAuthType::UserPrincipal {
        let required = [
            (TENANT_ID_FIELD, "Missing tenant id"),
            (USER_ID_FIELD, "Missing user id"),
            (FINGERPRINT_FIELD, "Missing fingerprint"),
            (PEMFILE_PATH_FIELD, "Missing pemfile"),
            (REGION_FIELD, "Missing region"),
        ];
        for (key, message) in required {
            if !parameters.contains_key(key) {
                return Err(Error::invalid_config(message));
            }
        }
    }
    Ok(())
}

fn parse_auth_type(parameters: &BTreeMap<String, String>) -> Result<OciAuthType> {
    let raw = parameters
        .get(AUTH_TYPE_FIELD)
        .ok_or_else(|| Error::invalid_config("Missing auth type"))?;
    raw.parse()
        .map_err(|_| Error::invalid_config("Wrong OCI client auth type"))
}

/// AWS credentials for SigV4 signing.
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub region: String,
    pub service_name: String,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("service_name", &self.service_name)
            .finish()
    }
}

impl AwsCredentials {
    pub fn from_connector(connector: &Connector) -> Result<Self> {
        let credential = |key: &str| {
            connector
                .credential
                .get(key)
                .cloned()
                .ok_or_else(|| Error::invalid_config(format!("Missing {key}")))
        };
        let parameter = |key: &str| {
            connector
                .parameters
                .get(key)
                .cloned()
                .ok_or_else(|| Error::invalid_config(format!("Missing {key}")))
        };

        Ok(Self {
            access_key: credential(ACCESS_KEY_FIELD)?,
            secret_key: credential(SECRET_KEY_FIELD)?,
            session_token: connector.credential.get(SESSION_TOKEN_FIELD).cloned(),
            region: parameter(REGION_FIELD)?,
            service_name: parameter(SERVICE_NAME_FIELD)?,
        })
    }
}
