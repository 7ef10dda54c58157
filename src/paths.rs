//! On-disk layout of the model cache and URLs of the prebuilt repository.
//!
//! ```text
//! {cache_root}/models_cache/register/{task_or_model_id}/{version}/{model_name}[.zip]
//! {cache_root}/models_cache/deploy/{model_id}/chunks/{n}
//! {cache_root}/models_cache/models/{model_id}/{version}/{model_name}
//! ```
//!
//! Ids and versions must each be a single path segment. Model names may
//! nest (`huggingface/sentence-transformers/...`) but never climb out of
//! their directory. Anything else is rejected before a path is built, since
//! these paths are later removed recursively.

use std::path::{Component, Path, PathBuf};

use ml_connector_core::model::ModelFormat;
use ml_connector_core::{Error, Result};

use crate::config::{CacheConfig, ModelRepoConfig};

pub const REGISTER_MODEL_FOLDER: &str = "register";
pub const DEPLOY_MODEL_FOLDER: &str = "deploy";
pub const MODELS_FOLDER: &str = "models";
pub const CHUNKS_FOLDER: &str = "chunks";

#[derive(Debug, Clone)]
pub struct ModelPaths {
    models_cache: PathBuf,
    repo_endpoint: String,
    metalist_endpoint: String,
}

impl ModelPaths {
    pub fn new(cache: &CacheConfig, repo: &ModelRepoConfig) -> Self {
        Self {
            models_cache: cache.root.join("models_cache"),
            repo_endpoint: repo.repo_endpoint.trim_end_matches('/').to_string(),
            metalist_endpoint: repo.metalist_endpoint.clone(),
        }
    }

    pub fn models_cache(&self) -> &Path {
        &self.models_cache
    }

    pub fn prebuilt_model_meta_list_url(&self) -> &str {
        &self.metalist_endpoint
    }

    /// `{repo}/{name}/{version}/{format}/config.json`
    pub fn prebuilt_model_config_url(&self, model_name: &str, version: &str, format: ModelFormat) -> String {
        format!(
            "{}/{}/{}/{}/config.json",
            self.repo_endpoint,
            model_name,
            version,
            format.lowercase()
        )
    }

    /// Zip url for a prebuilt model. The file name drops the first path
    /// segment of the model name and flattens the rest:
    /// `huggingface/sentence-transformers/x` at `1.0.0` in ONNX becomes
    /// `.../onnx/sentence-transformers_x-1.0.0-onnx.zip`.
    pub fn prebuilt_model_url(&self, model_name: &str, version: &str, format: ModelFormat) -> String {
        let suffix = model_name
            .split_once('/')
            .map(|(_, rest)| rest)
            .unwrap_or(model_name);
        let format = format.lowercase();
        let file_name = format!("{}-{}-{}", suffix.replace('/', "_"), version, format);
        format!(
            "{}/{}/{}/{}/{}.zip",
            self.repo_endpoint, model_name, version, format, file_name
        )
    }

    pub fn register_model_root(&self) -> PathBuf {
        self.models_cache.join(REGISTER_MODEL_FOLDER)
    }

    pub fn register_model_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.register_model_root().join(segment("id", id)?))
    }

    pub fn register_model_version_path(&self, id: &str, model_name: &str, version: &str) -> Result<PathBuf> {
        Ok(self
            .register_model_path(id)?
            .join(segment("version", version)?)
            .join(nested("model name", model_name)?))
    }

    pub fn deploy_model_root(&self) -> PathBuf {
        self.models_cache.join(DEPLOY_MODEL_FOLDER)
    }

    pub fn deploy_model_path(&self, model_id: &str) -> Result<PathBuf> {
        Ok(self.deploy_model_root().join(segment("model id", model_id)?))
    }

    pub fn deploy_model_zip_path(&self, model_id: &str, model_name: &str) -> Result<PathBuf> {
        let name = nested("model name", model_name)?;
        Ok(self.deploy_model_path(model_id)?.join(format!("{name}.zip")))
    }

    pub fn deploy_model_chunk_path(&self, model_id: &str, chunk_number: usize) -> Result<PathBuf> {
        Ok(self
            .deploy_model_path(model_id)?
            .join(CHUNKS_FOLDER)
            .join(chunk_number.to_string()))
    }

    pub fn model_cache_root(&self) -> PathBuf {
        self.models_cache.join(MODELS_FOLDER)
    }

    pub fn model_cache_path(&self, model_id: &str) -> Result<PathBuf> {
        Ok(self.model_cache_root().join(segment("model id", model_id)?))
    }

    pub fn model_cache_version_path(&self, model_id: &str, model_name: &str, version: &str) -> Result<PathBuf> {
        Ok(self
            .model_cache_path(model_id)?
            .join(segment("version", version)?)
            .join(nested("model name", model_name)?))
    }
}

/// `value` as exactly one ordinary path segment.
fn segment<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !value.contains(['/', '\\']) => Ok(value),
        _ => Err(Error::invalid_config(format!(
            "invalid {kind} `{value}`: expected a single path segment"
        ))),
    }
}

/// `value` as a relative path made only of ordinary segments.
fn nested<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
    let path = Path::new(value);
    let ordinary = path.components().all(|c| matches!(c, Component::Normal(_)));
    if value.is_empty() || value.contains('\\') || !ordinary {
        return Err(Error::invalid_config(format!(
            "invalid {kind} `{value}`: expected a relative path"
        )));
    }
    Ok(value)
}
