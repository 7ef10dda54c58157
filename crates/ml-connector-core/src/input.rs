//! Inputs accepted by the remote invocation orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MlInput {
    /// A batch of documents, sent to the remote model as `texts`.
    TextDocs {
        docs: Vec<String>,
        #[serde(default)]
        parameters: BTreeMap<String, String>,
    },
    /// Free-form parameters merged over the connector's own.
    Remote {
        #[serde(default)]
        parameters: BTreeMap<String, String>,
    },
}

impl MlInput {
    pub fn text_docs<I, S>(docs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MlInput::TextDocs {
            docs: docs.into_iter().map(Into::into).collect(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn remote(parameters: BTreeMap<String, String>) -> Self {
        MlInput::Remote { parameters }
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        match self {
            MlInput::TextDocs { parameters, .. } | MlInput::Remote { parameters } => parameters,
        }
    }
}
