//! Outbound request construction and signing.
//!
//! A request moves through three states, each its own type:
//!
//! 1. [`OutboundRequest`]: method, URL, headers, and body are fixed and
//!    validated, nothing is signed yet.
//! 2. [`SignedRequest`]: produced by [`OutboundRequest::sign`], which hands
//!    the request to a [`RequestSigner`] to add authentication headers.
//! 3. Dispatched: [`SignedRequest::send`] consumes the request and returns
//!    the raw `reqwest::Response`.
//!
//! A signed request cannot be modified, so a signature always covers the
//! exact bytes that go on the wire.

pub mod oci;
pub mod sigv4;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ml_connector_core::{Error, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Url;

pub use oci::{OciAuthProvider, OciAuthProviderFactory, OciRequestSigner};
pub use sigv4::SigV4Signer;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// HTTP methods a connector action may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn requires_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            _ => Err(Error::UnsupportedMethod(s.to_string())),
        }
    }
}

/// Adds authentication headers to a request before dispatch.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &mut OutboundRequest) -> Result<()>;

    /// Whether signing may read key files or do RSA work. Such signers run
    /// on the blocking pool when called through [`OutboundRequest::sign_async`].
    fn may_block(&self) -> bool {
        true
    }
}

/// Signer for connectors that authenticate through plain headers only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSigner;

impl RequestSigner for NoopSigner {
    fn sign(&self, _request: &mut OutboundRequest) -> Result<()> {
        Ok(())
    }

    fn may_block(&self) -> bool {
        false
    }
}

/// A validated request that has not been signed or sent.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: HttpMethod,
    url: Url,
    headers: HeaderMap,
    body: Option<String>,
}

impl OutboundRequest {
    /// Build a request from rendered connector values.
    ///
    /// `method` is parsed first so an unsupported method fails before
    /// anything else is looked at. POST and PUT require a payload; GET and
    /// DELETE drop it. A `Content-Type: application/json` header is added
    /// when `headers` does not set one.
    pub fn new(
        method: &str,
        endpoint: &str,
        headers: &BTreeMap<String, String>,
        payload: Option<&str>,
    ) -> Result<Self> {
        let method: HttpMethod = method.parse()?;
        let url = Url::parse(endpoint)
            .map_err(|e| Error::InvalidUri(format!("{endpoint}: {e}")))?;

        let body = if method.requires_body() {
            match payload {
                Some(p) => Some(p.to_string()),
                None => {
                    return Err(Error::InvalidPayload(format!(
                        "{method} request to {endpoint} has no payload"
                    )))
                }
            }
        } else {
            None
        };

        let mut header_map = HeaderMap::with_capacity(headers.len() + 1);
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::invalid_config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::invalid_config(format!("invalid value for header {name}: {e}")))?;
            header_map.insert(name, value);
        }
        if !header_map.contains_key(CONTENT_TYPE) {
            header_map.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        }

        Ok(Self {
            method,
            url,
            headers: header_map,
            body,
        })
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// `host[:port]` as it should appear in a `host` header.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Path plus query, as used by request-target style signatures.
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }

    /// Set a header, replacing any previous value.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Signing(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Signing(format!("invalid value for header {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn sign(mut self, signer: &dyn RequestSigner) -> Result<SignedRequest> {
        signer.sign(&mut self)?;
        Ok(SignedRequest { inner: self })
    }

    /// [`sign`](Self::sign) for async callers. Key loading and signature
    /// computation happen on tokio's blocking pool, never on a runtime
    /// worker.
    pub async fn sign_async(self, signer: Arc<dyn RequestSigner>) -> Result<SignedRequest> {
        if !signer.may_block() {
            return self.sign(signer.as_ref());
        }
        tokio::task::spawn_blocking(move || self.sign(signer.as_ref()))
            .await
            .map_err(|e| Error::Signing(format!("signing task failed: {e}")))?
    }
}

/// A request whose headers are final.
#[derive(Debug)]
pub struct SignedRequest {
    inner: OutboundRequest,
}

impl SignedRequest {
    pub fn request(&self) -> &OutboundRequest {
        &self.inner
    }

    pub async fn send(self, client: &reqwest::Client) -> reqwest::Result<reqwest::Response> {
        let OutboundRequest {
            method,
            url,
            headers,
            body,
        } = self.inner;
        let mut builder = client.request(method.to_reqwest(), url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        builder.send().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert!(matches!(
            "PATCH".parse::<HttpMethod>(),
            Err(Error::UnsupportedMethod(m)) if m == "PATCH"
        ));
    }

    #[test]
    fn test_unsupported_method_checked_before_url() {
        let err = OutboundRequest::new("TRACE", "not a url", &BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMethod(_)));
    }

    #[test]
    fn test_post_requires_payload() {
        let err = OutboundRequest::new("POST", "http://localhost/x", &BTreeMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[test]
    fn test_get_drops_payload_and_defaults_content_type() {
        let req = OutboundRequest::new("get", "http://localhost:9200/x?a=1", &BTreeMap::new(), Some("{}"))
            .unwrap();
        assert!(req.body().is_none());
        assert_eq!(req.header_str("content-type"), Some("application/json"));
        assert_eq!(req.host_header(), "localhost:9200");
        assert_eq!(req.path_and_query(), "/x?a=1");
    }

    #[test]
    fn test_explicit_content_type_kept() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        let req = OutboundRequest::new("POST", "http://localhost/x", &headers, Some("hi")).unwrap();
        assert_eq!(req.header_str("content-type"), Some("text/plain"));
        assert_eq!(req.headers().get_all(CONTENT_TYPE).iter().count(), 1);
    }

    struct ThreadRecorder {
        blocking: bool,
        thread: parking_lot::Mutex<Option<std::thread::ThreadId>>,
    }

    impl ThreadRecorder {
        fn new(blocking: bool) -> Arc<Self> {
            Arc::new(Self {
                blocking,
                thread: parking_lot::Mutex::new(None),
            })
        }

        fn thread(&self) -> Option<std::thread::ThreadId> {
            *self.thread.lock()
        }
    }

    impl RequestSigner for ThreadRecorder {
        fn sign(&self, request: &mut OutboundRequest) -> Result<()> {
            *self.thread.lock() = Some(std::thread::current().id());
            request.set_header("x-signed", "1")
        }

        fn may_block(&self) -> bool {
            self.blocking
        }
    }

    #[tokio::test]
    async fn test_sign_async_moves_blocking_signers_off_the_runtime() {
        let signer = ThreadRecorder::new(true);
        let req = OutboundRequest::new("GET", "http://localhost/x", &BTreeMap::new(), None).unwrap();
        let signed = req.sign_async(signer.clone()).await.unwrap();
        assert_eq!(signed.request().header_str("x-signed"), Some("1"));
        assert!(signer.thread().is_some());
        assert_ne!(signer.thread(), Some(std::thread::current().id()));
    }

    #[tokio::test]
    async fn test_sign_async_runs_cheap_signers_inline() {
        let signer = ThreadRecorder::new(false);
        let req = OutboundRequest::new("GET", "http://localhost/x", &BTreeMap::new(), None).unwrap();
        req.sign_async(signer.clone()).await.unwrap();
        assert_eq!(signer.thread(), Some(std::thread::current().id()));
    }
}
