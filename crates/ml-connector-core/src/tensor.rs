//! Uniform output shape for remote and local inference.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the tensor produced when a response is mapped without a script.
pub const RESPONSE_TENSOR_NAME: &str = "response";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTensor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<i64>>,
    #[serde(default, rename = "dataAsMap", skip_serializing_if = "Option::is_none")]
    pub data_as_map: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ModelTensor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Tensor wrapping a parsed JSON response. Objects become the map
    /// directly; any other JSON value is nested under `response`.
    pub fn from_json(name: impl Into<String>, value: Value) -> Self {
        let map = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert(RESPONSE_TENSOR_NAME.to_string(), other);
                map
            }
        };
        Self {
            data_as_map: Some(map),
            ..Self::named(name)
        }
    }
}

/// Tensors produced by one remote call, tagged with its status code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTensors {
    #[serde(rename = "output")]
    pub tensors: Vec<ModelTensor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl ModelTensors {
    pub fn new(tensors: Vec<ModelTensor>) -> Self {
        Self {
            tensors,
            status_code: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTensorOutput {
    #[serde(rename = "inference_results")]
    pub outputs: Vec<ModelTensors>,
}

impl ModelTensorOutput {
    pub fn new(outputs: Vec<ModelTensors>) -> Self {
        Self { outputs }
    }
}
