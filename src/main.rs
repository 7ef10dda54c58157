//! # ML Connector CLI (`mlc`)
//!
//! Run connector actions and register model archives from the command line.
//!
//! ## Usage
//!
//! ```bash
//! mlc --config ./config/mlc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mlc predict <connector.json>` | Run the PREDICT action and print tensors |
//! | `mlc download <connector.json> --out <file>` | Run the DOWNLOAD action into a file |
//! | `mlc register --url ... --hash ...` | Download, verify, and chunk a model archive |
//! | `mlc verify-zip <path> --format onnx` | Check a model archive's entries |
//! | `mlc check-auth <connector.json>` | Validate a connector's credentials |
//! | `mlc completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Embed two documents through an HTTP connector
//! mlc predict ./connectors/embed.json --doc "hello" --doc "world"
//!
//! # Ask an OCI GenAI connector, filling ${parameters.prompt}
//! mlc predict ./connectors/genai.json --param prompt="What is OpenSearch?"
//!
//! # Register a prebuilt model
//! mlc register --prebuilt --name huggingface/sentence-transformers/all-MiniLM-L6-v2 \
//!     --version 1.0.1 --format torch_script
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use futures::StreamExt;
use ml_connector::artifact::{self, ModelHelper};
use ml_connector::config::{self, Config};
use ml_connector::executor::{Executor, ExecutorOptions};
use ml_connector::remote::RemoteInvoker;
use ml_connector::script::ScriptEngine;
use ml_connector_core::auth::AwsCredentials;
use ml_connector_core::connector::Connector;
use ml_connector_core::input::MlInput;
use ml_connector_core::model::{FunctionName, ModelFormat, RegisterModelInput};
use ml_connector_core::protocol::ConnectorProtocol;
use serde_json::json;
use tokio::io::AsyncWriteExt;

/// ML Connector CLI: signed calls to remote models and model archive
/// registration.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means defaults for every section.
#[derive(Parser)]
#[command(
    name = "mlc",
    about = "Signed remote-model connectors and model archive tooling",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mlc.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a connector's PREDICT action.
    ///
    /// With `--doc`, the documents are sent as a text-docs batch; otherwise
    /// only the parameters are sent.
    Predict {
        /// Connector definition (JSON).
        connector: PathBuf,

        /// Call parameter, overriding the connector's (repeatable).
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Document to embed (repeatable).
        #[arg(long = "doc")]
        docs: Vec<String>,
    },

    /// Run a connector's DOWNLOAD action and write the body to a file.
    Download {
        connector: PathBuf,

        #[arg(long)]
        out: PathBuf,

        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },

    /// Download a model archive, verify it, and split it into chunks.
    Register {
        /// Model name. For `--prebuilt`, the repository path of the model.
        #[arg(long)]
        name: String,

        #[arg(long)]
        version: String,

        /// `torch_script` or `onnx`.
        #[arg(long, value_parser = parse_format)]
        format: ModelFormat,

        /// Archive location: http(s), `file://`, a local path, or
        /// `oci-os://{namespace}/{bucket}/{object}`.
        #[arg(long, required_unless_present_any = ["prebuilt", "connector"])]
        url: Option<String>,

        /// Expected SHA-256 of the archive.
        #[arg(long, required_unless_present = "prebuilt")]
        hash: Option<String>,

        #[arg(long, value_parser = parse_function, default_value = "text_embedding")]
        function: FunctionName,

        /// Connector whose DOWNLOAD action fetches the archive.
        #[arg(long)]
        connector: Option<PathBuf>,

        /// Resolve url, hash, and model config from the prebuilt repository.
        #[arg(long, conflicts_with_all = ["url", "hash", "connector"])]
        prebuilt: bool,

        #[arg(long)]
        oci_os_endpoint: Option<String>,

        /// OCI auth parameter for `oci-os://` urls (repeatable).
        #[arg(long = "oci-auth", value_parser = parse_key_val)]
        oci_auth: Vec<(String, String)>,

        /// Staging id; a random one is used when omitted.
        #[arg(long)]
        task_id: Option<String>,
    },

    /// Check a model archive for exactly one model file and a tokenizer.
    VerifyZip {
        path: PathBuf,

        #[arg(long, value_parser = parse_format)]
        format: ModelFormat,

        #[arg(long, value_parser = parse_function, default_value = "text_embedding")]
        function: FunctionName,
    },

    /// Validate a connector's credentials and load any signing key.
    CheckAuth { connector: PathBuf },

    /// Print shell completions.
    Completions { shell: Shell },
}

/// Parse a `key=value` pair for `--param` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_format(s: &str) -> Result<ModelFormat, String> {
    s.parse().map_err(|e: ml_connector_core::Error| e.to_string())
}

fn parse_function(s: &str) -> Result<FunctionName, String> {
    s.parse().map_err(|e: ml_connector_core::Error| e.to_string())
}

fn load_connector(path: &Path) -> anyhow::Result<Arc<Connector>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read connector file: {}", path.display()))?;
    let connector =
        Connector::from_json(&json).with_context(|| format!("Invalid connector: {}", path.display()))?;
    Ok(Arc::new(connector))
}

fn invoker(connector: Arc<Connector>, cfg: &Config) -> anyhow::Result<RemoteInvoker<Executor>> {
    let options = ExecutorOptions::default().with_http(cfg.http.clone());
    let executor = Executor::for_connector(connector, &options)?;
    let scripts = ScriptEngine::new(Duration::from_secs(cfg.scripts.timeout_secs));
    Ok(RemoteInvoker::new(executor, scripts))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "mlc", &mut std::io::stdout());
        return Ok(());
    }

    ml_connector::logging::init(cli.log_json);
    let cfg = config::load_config_or_default(&cli.config)?;

    match cli.command {
        Commands::Predict {
            connector,
            params,
            docs,
        } => {
            let invoker = invoker(load_connector(&connector)?, &cfg)?;
            let parameters: BTreeMap<String, String> = params.into_iter().collect();
            let input = if docs.is_empty() {
                MlInput::remote(parameters)
            } else {
                MlInput::TextDocs { docs, parameters }
            };
            let output = invoker.execute_predict(&input).await?;
            print_json(&output)?;
        }
        Commands::Download {
            connector,
            out,
            params,
        } => {
            let invoker = invoker(load_connector(&connector)?, &cfg)?;
            let response = invoker
                .execute_download(&params.into_iter().collect())
                .await?;
            let status = response.status();
            let mut file = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("Failed to create {}", out.display()))?;
            let mut body = response.into_stream();
            let mut written = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            print_json(&json!({
                "status": status,
                "bytes": written,
                "path": out,
            }))?;
        }
        Commands::Register {
            name,
            version,
            format,
            url,
            hash,
            function,
            connector,
            prebuilt,
            oci_os_endpoint,
            oci_auth,
            task_id,
        } => {
            let helper = ModelHelper::new(&cfg, ExecutorOptions::default().with_http(cfg.http.clone()))?;
            let task_id = task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let mut input = RegisterModelInput::new(name, version.clone(), format);
            input.function_name = function;
            if prebuilt {
                let catalog = helper.download_prebuilt_model_meta_list(&task_id, &input).await?;
                if !artifact::is_model_allowed(&input, &catalog) {
                    bail!(
                        "{} {} ({}) is not in the prebuilt model catalog",
                        input.model_name,
                        input.version,
                        input.model_format
                    );
                }
                input = helper.download_prebuilt_model_config(&task_id, &input).await?;
                input.function_name = function;
            } else {
                input.url = url.unwrap_or_default();
                input.hash_value = hash.unwrap_or_default();
                input.oci_os_endpoint = oci_os_endpoint;
                if !oci_auth.is_empty() {
                    input.oci_auth = Some(oci_auth.into_iter().collect());
                }
                if let Some(path) = connector {
                    input.url_connector = Some(load_connector(&path)?.as_ref().clone());
                }
            }

            let metadata = helper.download_and_split(&input, &task_id, &version).await?;
            print_json(&json!({
                "task_id": task_id,
                "model_name": input.model_name,
                "model_format": input.model_format,
                "model_config": input.model_config,
                "chunk_files": metadata.chunk_files,
                "model_size_in_bytes": metadata.model_size_in_bytes,
                "model_file_hash": metadata.model_file_hash,
            }))?;
        }
        Commands::VerifyZip {
            path,
            format,
            function,
        } => {
            artifact::verify_model_zip_file(format, &path, function)
                .with_context(|| format!("{} failed verification", path.display()))?;
            let hash = artifact::calculate_file_hash(&path)?;
            print_json(&json!({
                "path": path,
                "model_format": format,
                "function_name": function,
                "model_file_hash": hash,
                "valid": true,
            }))?;
        }
        Commands::CheckAuth { connector } => {
            let connector = load_connector(&connector)?;
            let report = match connector.protocol {
                ConnectorProtocol::Http => json!({ "auth": "none" }),
                ConnectorProtocol::AwsSigV4 => {
                    let creds = AwsCredentials::from_connector(&connector)?;
                    json!({
                        "auth": "aws_sigv4",
                        "region": creds.region,
                        "service_name": creds.service_name,
                        "session_token": creds.session_token.is_some(),
                    })
                }
                ConnectorProtocol::OciSigV1 | ConnectorProtocol::OciGenai => {
                    let auth = connector
                        .oci_auth()
                        .context("connector has no OCI auth configuration")?;
                    let provider = ExecutorOptions::default().oci_auth.build(auth);
                    let key_id = provider.key_id()?;
                    provider.private_key()?;
                    json!({
                        "auth": auth.auth_type().as_str(),
                        "key_id": key_id,
                        "private_key": "loaded",
                    })
                }
            };
            print_json(&json!({
                "connector": connector.name,
                "protocol": connector.protocol,
                "check": report,
            }))?;
        }
        Commands::Completions { .. } => {} // handled before config load
    }

    Ok(())
}
