use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime settings for `mlc`. Every section is optional.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub model_repo: ModelRepoConfig,
    #[serde(default)]
    pub scripts: ScriptConfig,
}

/// Settings for the pooled HTTP client each executor owns.
///
/// `read_timeout_secs` bounds each wait for response bytes, so a slow but
/// steady body never trips it. `request_timeout_secs` is an optional
/// deadline for a whole request; artifact downloads ignore it.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    30
}
fn default_pool_max_idle() -> usize {
    32
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            request_timeout_secs: None,
            pool_max_idle_per_host: default_pool_max_idle(),
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// The same settings without a whole-request deadline, for transfers
    /// whose length is unbounded.
    pub fn for_downloads(&self) -> HttpConfig {
        HttpConfig {
            request_timeout_secs: None,
            ..self.clone()
        }
    }

    /// Build the shared client. Cheap to clone afterwards; clones share the
    /// connection pool.
    pub fn build_client(&self) -> ml_connector_core::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout())
            .read_timeout(self.read_timeout())
            .pool_max_idle_per_host(self.pool_max_idle_per_host);
        if let Some(deadline) = self.request_timeout() {
            builder = builder.timeout(deadline);
        }
        builder
            .build()
            .map_err(|e| ml_connector_core::Error::invalid_config(format!("failed to build http client: {e}")))
    }
}

/// Local model cache. Registered archives are staged and chunked under
/// `{root}/models_cache`.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("./data/ml_cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
        }
    }
}

/// Where prebuilt models and their catalog are published.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelRepoConfig {
    #[serde(default = "default_repo_endpoint")]
    pub repo_endpoint: String,
    #[serde(default = "default_metalist_endpoint")]
    pub metalist_endpoint: String,
}

fn default_repo_endpoint() -> String {
    "https://artifacts.opensearch.org/models/ml-models".to_string()
}
fn default_metalist_endpoint() -> String {
    "https://artifacts.opensearch.org/models/ml-models/model_listing/pre_trained_models.json".to_string()
}

impl Default for ModelRepoConfig {
    fn default() -> Self {
        Self {
            repo_endpoint: default_repo_endpoint(),
            metalist_endpoint: default_metalist_endpoint(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScriptConfig {
    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,
}

fn default_script_timeout() -> u64 {
    10
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_script_timeout(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.http.connect_timeout_secs == 0 {
        anyhow::bail!("http.connect_timeout_secs must be > 0");
    }
    if config.http.read_timeout_secs == 0 {
        anyhow::bail!("http.read_timeout_secs must be > 0");
    }
    if config.http.request_timeout_secs == Some(0) {
        anyhow::bail!("http.request_timeout_secs must be > 0");
    }
    if config.scripts.timeout_secs == 0 {
        anyhow::bail!("scripts.timeout_secs must be > 0");
    }
    for (key, value) in [
        ("model_repo.repo_endpoint", &config.model_repo.repo_endpoint),
        ("model_repo.metalist_endpoint", &config.model_repo.metalist_endpoint),
    ] {
        reqwest::Url::parse(value).with_context(|| format!("{key} is not a valid url: {value}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.http.connect_timeout_secs, 10);
        assert_eq!(config.http.read_timeout_secs, 30);
        assert_eq!(config.http.request_timeout_secs, None);
        assert_eq!(config.cache.root, PathBuf::from("./data/ml_cache"));
        assert_eq!(config.scripts.timeout_secs, 10);
    }

    #[test]
    fn test_sections_override_defaults() {
        let file = write_config(
            r#"
[http]
read_timeout_secs = 5

[cache]
root = "/var/lib/mlc"

[model_repo]
repo_endpoint = "http://localhost:9000/models"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.http.read_timeout_secs, 5);
        assert_eq!(config.http.connect_timeout_secs, 10);
        assert_eq!(config.cache.root, PathBuf::from("/var/lib/mlc"));
        assert_eq!(config.model_repo.repo_endpoint, "http://localhost:9000/models");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let file = write_config("[http]\nconnect_timeout_secs = 0\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("connect_timeout_secs"));
    }

    #[test]
    fn test_request_deadline_is_optional_and_dropped_for_downloads() {
        let file = write_config("[http]\nrequest_timeout_secs = 120\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.http.request_timeout(), Some(Duration::from_secs(120)));

        let downloads = config.http.for_downloads();
        assert_eq!(downloads.request_timeout(), None);
        assert_eq!(downloads.read_timeout(), Duration::from_secs(30));
        assert!(downloads.build_client().is_ok());

        let file = write_config("[http]\nrequest_timeout_secs = 0\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_bad_repo_url_rejected() {
        let file = write_config("[model_repo]\nmetalist_endpoint = \"not a url\"\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = load_config_or_default(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.http.pool_max_idle_per_host, 32);
    }
}
