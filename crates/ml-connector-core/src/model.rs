//! Model registration types: formats, function names, register input,
//! prebuilt catalog entries, and artifact metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::connector::Connector;
use crate::error::{Error, Result};

pub const PYTORCH_FILE_EXTENSION: &str = ".pt";
pub const ONNX_FILE_EXTENSION: &str = ".onnx";
pub const TOKENIZER_FILE_NAME: &str = "tokenizer.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelFormat {
    TorchScript,
    Onnx,
}

impl ModelFormat {
    pub const ALL: [ModelFormat; 2] = [ModelFormat::TorchScript, ModelFormat::Onnx];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::TorchScript => "TORCH_SCRIPT",
            ModelFormat::Onnx => "ONNX",
        }
    }

    /// File extension of the model file inside an archive of this format.
    pub fn file_extension(&self) -> &'static str {
        match self {
            ModelFormat::TorchScript => PYTORCH_FILE_EXTENSION,
            ModelFormat::Onnx => ONNX_FILE_EXTENSION,
        }
    }

    /// Lower-case name used in prebuilt repository paths and catalogs.
    pub fn lowercase(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid_config(format!("Wrong model format: {s}")))
    }
}

/// Kind of model being registered. Decides which archive entries are
/// mandatory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionName {
    #[default]
    TextEmbedding,
    SparseEncoding,
    SparseTokenize,
    MetricsCorrelation,
    Remote,
}

impl FunctionName {
    pub const ALL: [FunctionName; 5] = [
        FunctionName::TextEmbedding,
        FunctionName::SparseEncoding,
        FunctionName::SparseTokenize,
        FunctionName::MetricsCorrelation,
        FunctionName::Remote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionName::TextEmbedding => "TEXT_EMBEDDING",
            FunctionName::SparseEncoding => "SPARSE_ENCODING",
            FunctionName::SparseTokenize => "SPARSE_TOKENIZE",
            FunctionName::MetricsCorrelation => "METRICS_CORRELATION",
            FunctionName::Remote => "REMOTE",
        }
    }

    /// Sparse tokenizers ship only a tokenizer.
    pub fn requires_model_file(&self) -> bool {
        !matches!(self, FunctionName::SparseTokenize)
    }

    pub fn requires_tokenizer(&self) -> bool {
        !matches!(self, FunctionName::MetricsCorrelation)
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunctionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid_config(format!("Wrong function name: {s}")))
    }
}

/// Text embedding settings carried in a prebuilt model's `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextEmbeddingModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimension: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pooling_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_config: Option<String>,
}

/// Everything needed to fetch and stage one model archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterModelInput {
    pub model_name: String,
    pub version: String,
    pub model_format: ModelFormat,
    #[serde(default)]
    pub function_name: FunctionName,
    /// Expected SHA-256 of the archive, lower-case hex.
    #[serde(default, rename = "model_content_hash_value")]
    pub hash_value: String,
    #[serde(default)]
    pub url: String,
    /// Connector with a DOWNLOAD action used instead of a direct fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_connector: Option<Connector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_os_endpoint: Option<String>,
    /// OCI auth parameters for `oci-os://` urls, same keys as an OCI connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_auth: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_config: Option<TextEmbeddingModelConfig>,
}

impl RegisterModelInput {
    pub fn new(model_name: impl Into<String>, version: impl Into<String>, model_format: ModelFormat) -> Self {
        Self {
            model_name: model_name.into(),
            version: version.into(),
            model_format,
            function_name: FunctionName::default(),
            hash_value: String::new(),
            url: String::new(),
            url_connector: None,
            oci_os_endpoint: None,
            oci_auth: None,
            model_config: None,
        }
    }
}

/// Prebuilt catalog entry: a model name and the versions/formats published
/// for it. Versions and formats are lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
    #[serde(default)]
    pub version: Vec<String>,
    #[serde(default)]
    pub format: Vec<String>,
}

/// Result of a successful download-and-split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub chunk_files: Vec<PathBuf>,
    pub model_size_in_bytes: u64,
    pub model_file_hash: String,
}
