//! Sandboxed Lua 5.4 runtime for connector pre- and post-process scripts.
//!
//! A connector action may carry Lua source in `pre_process_function` and
//! `post_process_function`. Each script is a chunk that `return`s a value:
//!
//! - **pre-process** sees the globals `docs` (array of strings) and `params`
//!   (table), and returns a table of extra request parameters. String values
//!   are used as-is; anything else is JSON-encoded.
//! - **post-process** sees `response` (the parsed JSON body), `status`, and
//!   `params`, and returns either one tensor table or an array of them:
//!
//! ```lua
//! local out = {}
//! for i, item in ipairs(response.data) do
//!   out[i] = { name = "sentence_embedding", data = item.embedding, shape = { #item.embedding } }
//! end
//! return out
//! ```
//!
//! Every run gets a fresh VM on a blocking thread (via
//! [`tokio::task::spawn_blocking`]) with an instruction-count hook that aborts
//! the script once its deadline passes.
//!
//! # Host APIs
//!
//! | Module   | Functions                          |
//! |----------|------------------------------------|
//! | `json`   | `parse`, `encode`                  |
//! | `log`    | `info`, `warn`, `error`, `debug`   |
//! | `base64` | `encode`, `decode`                 |
//! | `crypto` | `sha256`                           |
//!
//! `os`, `io`, `debug`, `loadfile`, and `dofile` are removed from the globals.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ml_connector_core::tensor::ModelTensor;
use ml_connector_core::{Error, Result};
use mlua::prelude::*;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct ScriptEngine {
    timeout: Duration,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ScriptEngine {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Turn a slice of documents into request parameters.
    pub async fn pre_process(
        &self,
        source: &str,
        docs: &[String],
        params: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let globals = vec![
            ("docs", Value::from(docs.to_vec())),
            ("params", params_to_json(params)),
        ];
        let value = self.run("pre_process", source, globals).await?;
        let Value::Object(map) = value else {
            return Err(Error::Script(
                "pre_process must return a table of parameters".to_string(),
            ));
        };
        Ok(map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect())
    }

    /// Map a parsed response into output tensors.
    pub async fn post_process(
        &self,
        source: &str,
        response: Value,
        status: u16,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<ModelTensor>> {
        let globals = vec![
            ("response", response),
            ("status", Value::from(status)),
            ("params", params_to_json(params)),
        ];
        let value = self.run("post_process", source, globals).await?;
        let tensors = match value {
            Value::Array(items) => items,
            Value::Object(_) => vec![value],
            other => {
                return Err(Error::Script(format!(
                    "post_process must return a tensor table or an array of them, got {other}"
                )))
            }
        };
        tensors
            .into_iter()
            .map(|t| {
                serde_json::from_value(t)
                    .map_err(|e| Error::Script(format!("invalid tensor returned by post_process: {e}")))
            })
            .collect()
    }

    async fn run(&self, name: &'static str, source: &str, globals: Vec<(&'static str, Value)>) -> Result<Value> {
        let source = source.to_string();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || run_chunk(name, &source, globals, timeout))
            .await
            .map_err(|e| Error::Script(format!("{name} task failed: {e}")))?
    }
}

fn params_to_json(params: &BTreeMap<String, String>) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn run_chunk(
    name: &str,
    source: &str,
    globals: Vec<(&'static str, Value)>,
    timeout: Duration,
) -> Result<Value> {
    let script_error = |e: LuaError| Error::Script(format!("{name}: {e}"));
    let lua = Lua::new();

    let deadline = Instant::now() + timeout;
    let timeout_secs = timeout.as_secs_f64();
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "script timed out after {timeout_secs} seconds"
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    register_host_apis(&lua, name).map_err(script_error)?;
    for (key, value) in globals {
        let value = json_value_to_lua(&lua, &value).map_err(script_error)?;
        lua.globals().set(key, value).map_err(script_error)?;
    }

    let result: LuaValue = lua.load(source).set_name(name).eval().map_err(script_error)?;
    lua_value_to_json(result).map_err(script_error)
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing and host APIs
// ═══════════════════════════════════════════════════════════════════════

fn register_host_apis(lua: &Lua, script_name: &str) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_json_api(lua)?;
    register_log_api(lua, script_name)?;
    register_base64_api(lua)?;
    register_crypto_api(lua)?;
    Ok(())
}

fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in ["os", "io", "loadfile", "dofile", "debug"] {
        globals.set(name, LuaValue::Nil)?;
    }
    Ok(())
}

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::RuntimeError(format!("json.parse: {e}")))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::RuntimeError(format!("json.encode: {e}")))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

/// `log.debug|info|warn|error(...)`. Arguments are joined by spaces;
/// strings go through as-is, anything else as compact JSON.
fn register_log_api(lua: &Lua, script_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;
    for level in ["debug", "info", "warn", "error"] {
        let script = script_name.to_string();
        let emit = lua.create_function(move |_lua, args: mlua::Variadic<LuaValue>| {
            let message = log_message(args)?;
            match level {
                "debug" => tracing::debug!(script = %script, "{message}"),
                "info" => tracing::info!(script = %script, "{message}"),
                "warn" => tracing::warn!(script = %script, "{message}"),
                _ => tracing::error!(script = %script, "{message}"),
            }
            Ok(())
        })?;
        log.set(level, emit)?;
    }
    lua.globals().set("log", log)
}

fn log_message(args: mlua::Variadic<LuaValue>) -> LuaResult<String> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args.iter().cloned() {
        parts.push(match arg {
            LuaValue::String(s) => s.to_str()?.to_string(),
            other => lua_value_to_json(other)?.to_string(),
        });
    }
    Ok(parts.join(" "))
}

/// `base64.encode/decode` and the unpadded URL-safe `encode_url/decode_url`.
/// Both sides work on raw bytes, so binary payloads round-trip.
fn register_base64_api(lua: &Lua) -> LuaResult<()> {
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine as _;

    let b64 = lua.create_table()?;
    for (encode_name, decode_name, engine) in [
        ("encode", "decode", STANDARD),
        ("encode_url", "decode_url", URL_SAFE_NO_PAD),
    ] {
        let encoder = engine.clone();
        b64.set(
            encode_name,
            lua.create_function(move |_lua, data: mlua::String| Ok(encoder.encode(&*data.as_bytes())))?,
        )?;
        b64.set(
            decode_name,
            lua.create_function(move |lua, data: mlua::String| {
                let bytes = engine
                    .decode(&*data.as_bytes())
                    .map_err(|e| LuaError::RuntimeError(format!("base64.{decode_name}: {e}")))?;
                lua.create_string(&bytes)
            })?,
        )?;
    }
    lua.globals().set("base64", b64)
}

fn register_crypto_api(lua: &Lua) -> LuaResult<()> {
    let crypto = lua.create_table()?;

    crypto.set(
        "sha256",
        lua.create_function(|_lua, data: mlua::String| Ok(hex::encode(Sha256::digest(&*data.as_bytes()))))?,
    )?;

    lua.globals().set("crypto", crypto)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

/// Deepest table nesting converted to JSON. A table that contains itself
/// fails here instead of recursing without end.
const MAX_TABLE_DEPTH: usize = 64;

fn json_value_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => n.as_f64().map_or(LuaValue::Nil, LuaValue::Number),
        },
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        // Positions are kept, so a JSON null leaves a hole rather than
        // shifting later items down.
        Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_value_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), json_value_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

fn lua_value_to_json(value: LuaValue) -> LuaResult<Value> {
    lua_to_json(value, 0)
}

fn lua_to_json(value: LuaValue, depth: usize) -> LuaResult<Value> {
    Ok(match value {
        LuaValue::Nil => Value::Null,
        LuaValue::Boolean(b) => Value::Bool(b),
        LuaValue::Integer(i) => Value::from(i),
        LuaValue::Number(n) => serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
        LuaValue::String(s) => Value::String(s.to_str()?.to_string()),
        LuaValue::Table(table) if depth < MAX_TABLE_DEPTH => table_to_json(table, depth + 1)?,
        LuaValue::Table(_) => {
            return Err(LuaError::RuntimeError(format!(
                "tables nested deeper than {MAX_TABLE_DEPTH} levels cannot be encoded"
            )))
        }
        other => {
            return Err(LuaError::RuntimeError(format!(
                "a Lua {} cannot be encoded as JSON",
                other.type_name()
            )))
        }
    })
}

enum TableKey {
    Index(i64),
    Name(String),
}

/// A table keyed exactly `1..=n` becomes an array. Any other table becomes
/// an object, with integer keys written as their decimal form, so sparse
/// tables keep their indices.
fn table_to_json(table: LuaTable, depth: usize) -> LuaResult<Value> {
    let mut entries = Vec::new();
    let mut positive_indices = true;
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        let key = match key {
            LuaValue::Integer(i) => {
                positive_indices &= i >= 1;
                TableKey::Index(i)
            }
            LuaValue::String(s) => {
                positive_indices = false;
                TableKey::Name(s.to_str()?.to_string())
            }
            other => {
                return Err(LuaError::RuntimeError(format!(
                    "a Lua {} cannot be a JSON object key",
                    other.type_name()
                )))
            }
        };
        entries.push((key, lua_to_json(value, depth)?));
    }

    let len = entries.len();
    let dense = positive_indices
        && len > 0
        && entries
            .iter()
            .all(|(key, _)| matches!(key, TableKey::Index(i) if *i as usize <= len));
    if dense {
        let mut items = vec![Value::Null; len];
        for (key, value) in entries {
            if let TableKey::Index(i) = key {
                items[i as usize - 1] = value;
            }
        }
        return Ok(Value::Array(items));
    }

    Ok(Value::Object(
        entries
            .into_iter()
            .map(|(key, value)| {
                let key = match key {
                    TableKey::Index(i) => i.to_string(),
                    TableKey::Name(name) => name,
                };
                (key, value)
            })
            .collect(),
    ))
}
