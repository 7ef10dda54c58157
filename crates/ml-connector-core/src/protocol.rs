//! Wire protocols a connector can speak.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Closed set of connector protocols.
///
/// Every executor lookup matches this exhaustively, so adding a variant
/// forces each dispatch site to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorProtocol {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "aws_sigv4")]
    AwsSigV4,
    #[serde(rename = "oci_sigv1")]
    OciSigV1,
    #[serde(rename = "oci_genai")]
    OciGenai,
}

impl ConnectorProtocol {
    pub const ALL: [ConnectorProtocol; 4] = [
        ConnectorProtocol::Http,
        ConnectorProtocol::AwsSigV4,
        ConnectorProtocol::OciSigV1,
        ConnectorProtocol::OciGenai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorProtocol::Http => "http",
            ConnectorProtocol::AwsSigV4 => "aws_sigv4",
            ConnectorProtocol::OciSigV1 => "oci_sigv1",
            ConnectorProtocol::OciGenai => "oci_genai",
        }
    }

    /// True for both OCI flavours, which share auth parameters and signing.
    pub fn is_oci(&self) -> bool {
        matches!(self, ConnectorProtocol::OciSigV1 | ConnectorProtocol::OciGenai)
    }
}

impl fmt::Display for ConnectorProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|p| p.as_str()).collect();
                Error::UnsupportedProtocol(format!(
                    "{s} (supported: {})",
                    valid.join(", ")
                ))
            })
    }
}
