//! Model artifact handling: fetch a model archive, check its integrity, and
//! split it into fixed-size chunks for storage.
//!
//! An archive can come from four places, chosen in this order:
//!
//! | Source                          | Fetched with                               |
//! |---------------------------------|--------------------------------------------|
//! | `url_connector` on the input    | the connector's `DOWNLOAD` action          |
//! | `oci-os://{ns}/{bucket}/{obj}`  | OCI-signed GET against `oci_os_endpoint`   |
//! | `file://...` or a bare path     | local copy                                 |
//! | anything else                   | plain HTTP GET                             |
//!
//! Whatever the source, the archive is staged next to its chunk directory,
//! hashed, verified, and split. The staged file never outlives the call.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use ml_connector_core::auth::OciAuthConfig;
use ml_connector_core::model::{
    ArtifactMetadata, FunctionName, ModelFormat, ModelMeta, RegisterModelInput, TextEmbeddingModelConfig,
    TOKENIZER_FILE_NAME,
};
use ml_connector_core::{Error, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::executor::{Executor, ExecutorOptions, Response};
use crate::paths::{ModelPaths, CHUNKS_FOLDER};
use crate::remote::RemoteInvoker;
use crate::script::ScriptEngine;
use crate::signing::{OciRequestSigner, OutboundRequest};

/// Size of every chunk but the last.
pub const CHUNK_SIZE: u64 = 10_000_000;

pub const OCI_OS_SCHEME: &str = "oci-os";

const DIRECT_DOWNLOAD: &str = "direct-download";
const OBJECT_STORAGE: &str = "oci-object-storage";

/// Downloads, verifies, and chunks model archives under the configured
/// cache root.
pub struct ModelHelper {
    paths: ModelPaths,
    client: reqwest::Client,
    options: ExecutorOptions,
    scripts: ScriptEngine,
}

impl ModelHelper {
    /// Downloads run without a whole-request deadline, both on the helper's
    /// own client and on executors built for a `url_connector`. The per-read
    /// timeout still applies.
    pub fn new(config: &Config, options: ExecutorOptions) -> Result<Self> {
        let http = config.http.for_downloads();
        let client = http.build_client()?;
        let options = ExecutorOptions {
            http: options.http.for_downloads(),
            ..options
        };
        let paths = ModelPaths::new(&config.cache, &config.model_repo);
        info!(cache = %paths.models_cache().display(), "model helper ready");
        Ok(Self {
            paths,
            client,
            options,
            scripts: ScriptEngine::new(Duration::from_secs(config.scripts.timeout_secs)),
        })
    }

    pub fn paths(&self) -> &ModelPaths {
        &self.paths
    }

    /// Fetch the archive described by `input`, check it against the
    /// declared hash and format, and split it into chunks under
    /// `register/{task_id}/{version}/{model_name}/chunks`.
    ///
    /// A hash mismatch fails before anything is chunked. The staged archive
    /// is removed on every path, and a partially written chunk directory is
    /// removed when splitting fails.
    pub async fn download_and_split(
        &self,
        input: &RegisterModelInput,
        task_id: &str,
        version: &str,
    ) -> Result<ArtifactMetadata> {
        let register_path = self
            .paths
            .register_model_version_path(task_id, &input.model_name, version)?;
        let zip_path = with_zip_extension(&register_path);
        let chunks_dir = register_path.join(CHUNKS_FOLDER);

        if let Some(parent) = zip_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged = CleanupGuard::new(zip_path.clone());
        debug!(model = %input.model_name, path = %zip_path.display(), "staging model archive");

        self.fetch_archive(input, &zip_path).await?;

        let format = input.model_format;
        let function_name = input.function_name;
        let expected = input.hash_value.clone();
        let metadata = tokio::task::spawn_blocking(move || -> Result<ArtifactMetadata> {
            let actual = calculate_file_hash(&zip_path)?;
            if !actual.eq_ignore_ascii_case(&expected) {
                error!(expected = %expected, actual = %actual, "model content hash does not match");
                return Err(Error::HashMismatch { expected, actual });
            }
            verify_model_zip_file(format, &zip_path, function_name)?;

            let model_size_in_bytes = std::fs::metadata(&zip_path)?.len();
            let chunks = CleanupGuard::new(chunks_dir.clone());
            let chunk_files = split_file_into_chunks(&zip_path, &chunks_dir, CHUNK_SIZE)?;
            chunks.disarm();

            Ok(ArtifactMetadata {
                chunk_files,
                model_size_in_bytes,
                model_file_hash: actual,
            })
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        drop(staged);
        info!(
            model = %input.model_name,
            chunks = metadata.chunk_files.len(),
            bytes = metadata.model_size_in_bytes,
            "model archive split"
        );
        Ok(metadata)
    }

    async fn fetch_archive(&self, input: &RegisterModelInput, target: &Path) -> Result<()> {
        if let Some(connector) = &input.url_connector {
            let connector = Arc::new(connector.clone_connector()?);
            let executor = Executor::for_connector(connector, &self.options)?;
            let invoker = RemoteInvoker::new(executor, self.scripts.clone());
            let response = invoker.execute_download(&BTreeMap::new()).await?;
            return write_body(response, target).await;
        }

        match ArchiveSource::parse(&input.url)? {
            ArchiveSource::ObjectStorage {
                namespace,
                bucket,
                object,
            } => {
                self.download_from_object_storage(input, &namespace, &bucket, &object, target)
                    .await
            }
            ArchiveSource::Local(path) => {
                tokio::fs::copy(&path, target).await?;
                Ok(())
            }
            ArchiveSource::Http(url) => self.download_url(&url, target).await,
        }
    }

    async fn download_from_object_storage(
        &self,
        input: &RegisterModelInput,
        namespace: &str,
        bucket: &str,
        object: &str,
        target: &Path,
    ) -> Result<()> {
        let endpoint = input
            .oci_os_endpoint
            .as_deref()
            .ok_or_else(|| Error::invalid_config("Missing OCI object storage endpoint"))?;
        let auth = input
            .oci_auth
            .as_ref()
            .ok_or_else(|| Error::invalid_config("Missing OCI client auth parameters"))?;
        let auth = OciAuthConfig::from_parameters(auth)?;

        let mut url = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::InvalidUri(format!("{endpoint}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUri(format!("{endpoint} cannot carry a path")))?
            .pop_if_empty()
            .extend(["n", namespace, "b", bucket, "o", object]);

        debug!(endpoint, namespace, bucket, object, "downloading model from object storage");
        let signer = Arc::new(OciRequestSigner::new(self.options.oci_auth.build(&auth)));
        let signed = OutboundRequest::new("GET", url.as_str(), &BTreeMap::new(), None)?
            .sign_async(signer)
            .await?;
        let response = signed.send(&self.client).await.map_err(|e| Error::Transport {
            connector: OBJECT_STORAGE.to_string(),
            endpoint: url.to_string(),
            message: e.to_string(),
        })?;
        let response = Response::from_reqwest(response, OBJECT_STORAGE, url.as_str());
        if !response.is_success() {
            warn!(status = response.status(), "object storage download failed");
            return Err(response.into_remote_error().await);
        }
        write_body(response, target).await
    }

    async fn download_url(&self, url: &str, target: &Path) -> Result<()> {
        debug!(url, "downloading model");
        let response = self.client.get(url).send().await.map_err(|e| Error::Transport {
            connector: DIRECT_DOWNLOAD.to_string(),
            endpoint: url.to_string(),
            message: e.to_string(),
        })?;
        let response = Response::from_reqwest(response, DIRECT_DOWNLOAD, url);
        if !response.is_success() {
            warn!(url, status = response.status(), "model download failed");
            return Err(response.into_remote_error().await);
        }
        write_body(response, target).await
    }

    /// Fetch the prebuilt model catalog.
    pub async fn download_prebuilt_model_meta_list(
        &self,
        task_id: &str,
        input: &RegisterModelInput,
    ) -> Result<Vec<ModelMeta>> {
        let _staging = CleanupGuard::new(self.paths.register_model_path(task_id)?);
        let cache_file = self
            .paths
            .register_model_version_path(task_id, &input.model_name, &input.version)?
            .join("model_meta_list.json");
        tokio::fs::create_dir_all(parent_of(&cache_file)).await?;

        self.download_url(self.paths.prebuilt_model_meta_list_url(), &cache_file)
            .await?;
        let bytes = tokio::fs::read(&cache_file).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidResponse(format!("invalid model meta list: {e}")))
    }

    /// Resolve a prebuilt model into a full register input: format, model
    /// config, and content hash come from the repository's `config.json`,
    /// the url points at the published archive.
    pub async fn download_prebuilt_model_config(
        &self,
        task_id: &str,
        input: &RegisterModelInput,
    ) -> Result<RegisterModelInput> {
        let _staging = CleanupGuard::new(self.paths.register_model_path(task_id)?);
        let cache_file = self
            .paths
            .register_model_version_path(task_id, &input.model_name, &input.version)?
            .join("config.json");
        tokio::fs::create_dir_all(parent_of(&cache_file)).await?;

        let config_url =
            self.paths
                .prebuilt_model_config_url(&input.model_name, &input.version, input.model_format);
        self.download_url(&config_url, &cache_file).await?;

        let bytes = tokio::fs::read(&cache_file).await?;
        let config: Option<PrebuiltModelConfig> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidResponse(format!("invalid model config: {e}")))?;
        let config = config.ok_or_else(|| Error::InvalidResponse("model config not found".to_string()))?;

        let mut resolved = RegisterModelInput::new(
            input.model_name.clone(),
            input.version.clone(),
            config.model_format.unwrap_or(input.model_format),
        );
        resolved.function_name = input.function_name;
        resolved.url = self
            .paths
            .prebuilt_model_url(&input.model_name, &input.version, input.model_format);
        resolved.model_config = config.model_config;
        resolved.hash_value = config.model_content_hash_value.unwrap_or_default();
        Ok(resolved)
    }

    /// Remove every cached file for `model_id`: model cache, deploy
    /// directory, and register staging.
    ///
    /// An id that is not a single path segment is rejected before anything
    /// is touched. Removal itself is best effort; missing directories and
    /// failed deletes are only logged.
    pub fn delete_file_cache(&self, model_id: &str) -> Result<()> {
        let targets = [
            self.paths.model_cache_path(model_id)?,
            self.paths.deploy_model_path(model_id)?,
            self.paths.register_model_path(model_id)?,
        ];
        for path in &targets {
            delete_quietly(path);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PrebuiltModelConfig {
    #[serde(default)]
    model_format: Option<ModelFormat>,
    #[serde(default)]
    model_config: Option<TextEmbeddingModelConfig>,
    #[serde(default)]
    model_content_hash_value: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum ArchiveSource {
    ObjectStorage {
        namespace: String,
        bucket: String,
        object: String,
    },
    Local(PathBuf),
    Http(String),
}

impl ArchiveSource {
    fn parse(url: &str) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(Error::InvalidUri("model url is empty".to_string()));
        }
        if !url.contains("://") {
            return Ok(ArchiveSource::Local(PathBuf::from(url)));
        }
        let parsed = reqwest::Url::parse(url).map_err(|e| Error::InvalidUri(format!("{url}: {e}")))?;

        match parsed.scheme() {
            OCI_OS_SCHEME => {
                let invalid = || Error::InvalidUri(format!("Invalid OCI object storage URI {url}"));
                let namespace = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
                let parts: Vec<&str> = parsed.path().split('/').collect();
                match parts.as_slice() {
                    ["", bucket, object] if !bucket.is_empty() && !object.is_empty() => {
                        Ok(ArchiveSource::ObjectStorage {
                            namespace: namespace.to_string(),
                            bucket: bucket.to_string(),
                            object: object.to_string(),
                        })
                    }
                    _ => Err(invalid()),
                }
            }
            "file" => parsed
                .to_file_path()
                .map(ArchiveSource::Local)
                .map_err(|_| Error::InvalidUri(format!("{url} is not a local path"))),
            "http" | "https" => Ok(ArchiveSource::Http(url.to_string())),
            other => Err(Error::InvalidUri(format!("unsupported url scheme `{other}` in {url}"))),
        }
    }
}

/// Check a model archive in one pass over its entries.
///
/// Fails when an entry carries the other format's extension, when the
/// declared format's model file appears twice, when it is missing (unless
/// `function_name` ships no model file), or when `tokenizer.json` is
/// missing (unless `function_name` needs no tokenizer).
pub fn verify_model_zip_file(format: ModelFormat, path: &Path, function_name: FunctionName) -> Result<()> {
    let file = File::open(path)?;
    let archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| Error::InvalidArchive(format!("{}: {e}", path.display())))?;

    let mut has_model_file = false;
    let mut has_tokenizer = false;
    for name in archive.file_names() {
        for candidate in ModelFormat::ALL {
            let extension = candidate.file_extension();
            if !name.ends_with(extension) {
                continue;
            }
            if candidate != format {
                return Err(Error::ModelFormatMismatch {
                    format: format.to_string(),
                    extension: extension.to_string(),
                });
            }
            if has_model_file {
                return Err(Error::MultipleModelFiles);
            }
            has_model_file = true;
        }
        if name == TOKENIZER_FILE_NAME {
            has_tokenizer = true;
        }
    }

    if !has_model_file && function_name.requires_model_file() {
        return Err(Error::NoModelFile);
    }
    if !has_tokenizer && function_name.requires_tokenizer() {
        return Err(Error::NoTokenizerFile);
    }
    Ok(())
}

/// True when the catalog lists `input`'s name with its version and format.
pub fn is_model_allowed(input: &RegisterModelInput, meta_list: &[ModelMeta]) -> bool {
    let version = input.version.to_lowercase();
    let format = input.model_format.lowercase();
    meta_list
        .iter()
        .any(|meta| meta.name == input.model_name && meta.version.contains(&version) && meta.format.contains(&format))
}

/// SHA-256 of a file as lower-case hex.
pub fn calculate_file_hash(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Split `path` into `out_dir/0`, `out_dir/1`, ... of `chunk_size` bytes
/// each; the last chunk holds the remainder.
pub fn split_file_into_chunks(path: &Path, out_dir: &Path, chunk_size: u64) -> Result<Vec<PathBuf>> {
    if chunk_size == 0 {
        return Err(Error::invalid_config("chunk size must be > 0"));
    }
    let file = File::open(path)?;
    let count = file.metadata()?.len().div_ceil(chunk_size);
    std::fs::create_dir_all(out_dir)?;

    let mut reader = BufReader::new(file);
    let mut chunks = Vec::with_capacity(count as usize);
    for n in 0..count {
        let chunk_path = out_dir.join(n.to_string());
        let mut out = File::create(&chunk_path)?;
        std::io::copy(&mut (&mut reader).take(chunk_size), &mut out)?;
        chunks.push(chunk_path);
    }
    Ok(chunks)
}

async fn write_body(response: Response, target: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(target).await?;
    let mut body = response.into_stream();
    while let Some(chunk) = body.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

fn with_zip_extension(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".zip");
    PathBuf::from(staged)
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or(Path::new("."))
}

fn delete_quietly(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove"),
    }
}

/// Removes a file or directory on drop unless disarmed.
struct CleanupGuard {
    path: PathBuf,
    armed: bool,
}

impl CleanupGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            delete_quietly(&self.path);
        }
    }
}
