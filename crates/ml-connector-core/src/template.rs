//! `${namespace.key}` placeholder substitution.
//!
//! Connector URLs, headers, and request bodies are templates such as
//! `https://host/${parameters.model}/predict`. Rendering walks the template
//! once, left to right; substituted values are never re-scanned, so a
//! parameter value that itself contains `${...}` is emitted verbatim.
//!
//! Placeholders whose namespace is not being rendered (for example
//! `${credential.key}` while rendering only `parameters`) are left in place.
//! A placeholder in a rendered namespace with no matching entry fails with
//! [`Error::MissingParameter`].
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use ml_connector_core::template::render;
//!
//! let mut params = BTreeMap::new();
//! params.insert("input".to_string(), "hi".to_string());
//! let body = render(r#"{"input":"${parameters.input}"}"#, &params).unwrap();
//! assert_eq!(body, r#"{"input":"hi"}"#);
//! ```

use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub const PARAMETERS_NAMESPACE: &str = "parameters";
pub const CREDENTIAL_NAMESPACE: &str = "credential";

/// Render `${parameters.X}` placeholders.
pub fn render(template: &str, parameters: &BTreeMap<String, String>) -> Result<String> {
    render_scopes(template, &[(PARAMETERS_NAMESPACE, parameters)])
}

/// Render placeholders for several namespaces in a single pass.
pub fn render_scopes(template: &str, scopes: &[(&str, &BTreeMap<String, String>)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // unterminated placeholder, keep the tail as-is
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let inner = &after[..end];
        match resolve(inner, scopes) {
            Some(Ok(value)) => out.push_str(value),
            Some(Err(e)) => return Err(e),
            None => {
                out.push_str("${");
                out.push_str(inner);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Names referenced as `${namespace.X}` in `template`, in order of appearance.
pub fn placeholders<'a>(template: &'a str, namespace: &str) -> Vec<&'a str> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        if let Some((ns, key)) = after[..end].split_once('.') {
            if ns == namespace {
                names.push(key);
            }
        }
        rest = &after[end + 1..];
    }
    names
}

fn resolve<'v>(
    inner: &str,
    scopes: &[(&str, &'v BTreeMap<String, String>)],
) -> Option<Result<&'v str>> {
    let (ns, key) = inner.split_once('.')?;
    let (_, values) = scopes.iter().find(|(name, _)| *name == ns)?;
    Some(
        values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::MissingParameter(key.to_string())),
    )
}
