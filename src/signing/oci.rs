//! OCI request signing and auth provider construction.
//!
//! OCI authenticates API calls with an HTTP signature (draft-cavage style,
//! RSA-SHA256). The signing string is built from these headers, in order:
//!
//! ```text
//! date: Tue, 02 Jan 2024 03:04:05 GMT
//! (request-target): post /20231130/actions/generateText
//! host: inference.generativeai.us-chicago-1.oci.oraclecloud.com
//! x-content-sha256: <base64 sha256 of body>     (POST/PUT only)
//! content-type: application/json                (POST/PUT only)
//! content-length: 42                            (POST/PUT only)
//! ```
//!
//! and the result is sent as
//! `authorization: Signature version="1",keyId="...",algorithm="rsa-sha256",headers="...",signature="..."`.
//!
//! The key id and private key come from an [`OciAuthProvider`]:
//!
//! - `USER_PRINCIPAL`: key id `{tenancy}/{user}/{fingerprint}`, private key
//!   read from the configured PEM file the first time a request is signed.
//! - `RESOURCE_PRINCIPAL` / `INSTANCE_PRINCIPAL`: a session token and
//!   ephemeral key supplied by the runtime environment through an
//!   [`AmbientSessionSource`]; key id `ST${token}`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use ml_connector_core::auth::{OciAuthConfig, OciAuthType, UserPrincipalConfig};
use ml_connector_core::{Error, Result};
use parking_lot::Mutex;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{OutboundRequest, RequestSigner};

pub const RESOURCE_PRINCIPAL_TOKEN_ENV: &str = "OCI_RESOURCE_PRINCIPAL_RPST";
pub const RESOURCE_PRINCIPAL_PEM_ENV: &str = "OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM";

/// How long a session token without an `exp` claim is reused.
const SESSION_TTL_SECS: i64 = 300;
/// Tokens are re-read this long before their `exp`.
const SESSION_REFRESH_MARGIN_SECS: i64 = 60;

/// Source of the key id and private key used to sign OCI requests.
pub trait OciAuthProvider: Send + Sync {
    fn auth_type(&self) -> OciAuthType;
    fn key_id(&self) -> Result<String>;
    fn private_key(&self) -> Result<Arc<RsaPrivateKey>>;

    /// Key id and key for one signature, taken together.
    fn credentials(&self) -> Result<(String, Arc<RsaPrivateKey>)> {
        Ok((self.key_id()?, self.private_key()?))
    }
}

/// Parse a PEM private key in PKCS#8 or PKCS#1 form.
pub fn parse_private_key_pem(pem: &str) -> std::result::Result<RsaPrivateKey, String> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|pkcs8_err| {
            RsaPrivateKey::from_pkcs1_pem(pem)
                .map_err(|pkcs1_err| format!("not a PKCS#8 ({pkcs8_err}) or PKCS#1 ({pkcs1_err}) RSA key"))
        })
}

/// Reads a PEM key file on first use.
///
/// A failed read is reported as [`Error::KeyLoad`] and attempted again on
/// the next call; a successful read is cached for the life of the supplier.
pub struct PemFileKeySupplier {
    path: PathBuf,
    cached: Mutex<Option<Arc<RsaPrivateKey>>>,
}

impl PemFileKeySupplier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Result<Arc<RsaPrivateKey>> {
        let mut cached = self.cached.lock();
        if let Some(key) = cached.as_ref() {
            return Ok(Arc::clone(key));
        }
        let key_error = |reason: String| Error::KeyLoad {
            path: self.path.display().to_string(),
            reason,
        };
        let pem = std::fs::read_to_string(&self.path).map_err(|e| key_error(e.to_string()))?;
        let key = Arc::new(parse_private_key_pem(&pem).map_err(key_error)?);
        debug!(path = %self.path.display(), "loaded OCI private key");
        *cached = Some(Arc::clone(&key));
        Ok(key)
    }
}

pub struct UserPrincipalProvider {
    config: UserPrincipalConfig,
    key: PemFileKeySupplier,
}

impl UserPrincipalProvider {
    pub fn new(config: UserPrincipalConfig) -> Self {
        let key = PemFileKeySupplier::new(&config.pemfile_path);
        Self { config, key }
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }
}

impl OciAuthProvider for UserPrincipalProvider {
    fn auth_type(&self) -> OciAuthType {
        OciAuthType::UserPrincipal
    }

    fn key_id(&self) -> Result<String> {
        Ok(self.config.key_id())
    }

    fn private_key(&self) -> Result<Arc<RsaPrivateKey>> {
        self.key.get()
    }
}

/// Session credentials handed out by the hosting environment.
#[derive(Clone)]
pub struct AmbientSession {
    pub token: String,
    pub private_key: Arc<RsaPrivateKey>,
}

/// Environment-provided session credentials for resource and instance
/// principals.
pub trait AmbientSessionSource: Send + Sync {
    fn session(&self) -> Result<AmbientSession>;
}

/// Resource principal session read from the standard OCI environment
/// variables. Each variable holds either the value itself or a path to a
/// file containing it.
///
/// The session is cached until shortly before the token's `exp` claim (or
/// for a few minutes when the token carries none), then read again, so a
/// token rotated by the runtime is picked up by long-lived executors.
pub struct ResourcePrincipalEnv {
    token_var: String,
    pem_var: String,
    cached: Mutex<Option<CachedSession>>,
}

struct CachedSession {
    session: AmbientSession,
    refresh_at: DateTime<Utc>,
}

impl Default for ResourcePrincipalEnv {
    fn default() -> Self {
        Self::with_vars(RESOURCE_PRINCIPAL_TOKEN_ENV, RESOURCE_PRINCIPAL_PEM_ENV)
    }
}

impl ResourcePrincipalEnv {
    pub fn with_vars(token_var: impl Into<String>, pem_var: impl Into<String>) -> Self {
        Self {
            token_var: token_var.into(),
            pem_var: pem_var.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn session_at(&self, now: DateTime<Utc>) -> Result<AmbientSession> {
        let mut cached = self.cached.lock();
        if let Some(entry) = cached.as_ref().filter(|entry| now < entry.refresh_at) {
            return Ok(entry.session.clone());
        }

        let token = Self::read_env(&self.token_var)?;
        let pem = Self::read_env(&self.pem_var)?;
        let private_key = parse_private_key_pem(&pem).map_err(|reason| Error::KeyLoad {
            path: self.pem_var.clone(),
            reason,
        })?;
        let refresh_at = match token_expiry(&token) {
            Some(exp) => exp - chrono::Duration::seconds(SESSION_REFRESH_MARGIN_SECS),
            None => now + chrono::Duration::seconds(SESSION_TTL_SECS),
        };
        debug!(refresh_at = %refresh_at, "loaded resource principal session");

        let session = AmbientSession {
            token,
            private_key: Arc::new(private_key),
        };
        *cached = Some(CachedSession {
            session: session.clone(),
            refresh_at,
        });
        Ok(session)
    }

    fn read_env(name: &str) -> Result<String> {
        let raw = std::env::var(name).map_err(|_| Error::KeyLoad {
            path: name.to_string(),
            reason: "environment variable not set".to_string(),
        })?;
        let path = Path::new(&raw);
        if !raw.starts_with("-----BEGIN") && path.is_file() {
            return std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|e| Error::KeyLoad {
                    path: raw.clone(),
                    reason: e.to_string(),
                });
        }
        Ok(raw)
    }
}

impl AmbientSessionSource for ResourcePrincipalEnv {
    fn session(&self) -> Result<AmbientSession> {
        self.session_at(Utc::now())
    }
}

/// The `exp` claim of a JWT session token, if it has one.
fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let claims = token.split('.').nth(1)?;
    let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(claims.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&claims).ok()?;
    DateTime::from_timestamp(claims.get("exp")?.as_i64()?, 0)
}

/// Placeholder until an instance metadata session source is injected.
#[derive(Debug, Default)]
pub struct InstanceMetadataUnavailable;

impl AmbientSessionSource for InstanceMetadataUnavailable {
    fn session(&self) -> Result<AmbientSession> {
        Err(Error::KeyLoad {
            path: "instance metadata".to_string(),
            reason: "no instance principal session source configured".to_string(),
        })
    }
}

pub struct FederatedProvider {
    auth_type: OciAuthType,
    source: Arc<dyn AmbientSessionSource>,
}

impl OciAuthProvider for FederatedProvider {
    fn auth_type(&self) -> OciAuthType {
        self.auth_type
    }

    fn key_id(&self) -> Result<String> {
        Ok(format!("ST${}", self.source.session()?.token))
    }

    fn private_key(&self) -> Result<Arc<RsaPrivateKey>> {
        Ok(self.source.session()?.private_key)
    }

    fn credentials(&self) -> Result<(String, Arc<RsaPrivateKey>)> {
        let session = self.source.session()?;
        Ok((format!("ST${}", session.token), session.private_key))
    }
}

/// Builds an [`OciAuthProvider`] for a validated [`OciAuthConfig`].
#[derive(Clone)]
pub struct OciAuthProviderFactory {
    resource_source: Arc<dyn AmbientSessionSource>,
    instance_source: Arc<dyn AmbientSessionSource>,
}

impl Default for OciAuthProviderFactory {
    fn default() -> Self {
        Self {
            resource_source: Arc::new(ResourcePrincipalEnv::default()),
            instance_source: Arc::new(InstanceMetadataUnavailable),
        }
    }
}

impl OciAuthProviderFactory {
    pub fn with_resource_source(mut self, source: Arc<dyn AmbientSessionSource>) -> Self {
        self.resource_source = source;
        self
    }

    pub fn with_instance_source(mut self, source: Arc<dyn AmbientSessionSource>) -> Self {
        self.instance_source = source;
        self
    }

    /// No I/O happens here; keys are loaded when the first request is signed.
    pub fn build(&self, config: &OciAuthConfig) -> Arc<dyn OciAuthProvider> {
        match config {
            OciAuthConfig::UserPrincipal(user) => Arc::new(UserPrincipalProvider::new(user.clone())),
            OciAuthConfig::ResourcePrincipal => Arc::new(FederatedProvider {
                auth_type: OciAuthType::ResourcePrincipal,
                source: Arc::clone(&self.resource_source),
            }),
            OciAuthConfig::InstancePrincipal => Arc::new(FederatedProvider {
                auth_type: OciAuthType::InstancePrincipal,
                source: Arc::clone(&self.instance_source),
            }),
        }
    }
}

pub struct OciRequestSigner {
    provider: Arc<dyn OciAuthProvider>,
}

impl OciRequestSigner {
    pub fn new(provider: Arc<dyn OciAuthProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn OciAuthProvider> {
        &self.provider
    }

    pub fn sign_at(&self, request: &mut OutboundRequest, now: DateTime<Utc>) -> Result<()> {
        let (key_id, key) = self.provider.credentials()?;

        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let target = format!(
            "{} {}",
            request.method().as_str().to_ascii_lowercase(),
            request.path_and_query()
        );
        let host = request.host_header();

        let mut lines = vec![
            ("date", date.clone()),
            ("(request-target)", target),
            ("host", host.clone()),
        ];
        request.set_header("date", &date)?;
        request.set_header("host", &host)?;

        if request.method().requires_body() {
            let body = request.body().unwrap_or_default().to_string();
            let content_sha = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(body.as_bytes()));
            let content_type = request
                .header_str("content-type")
                .unwrap_or(super::DEFAULT_CONTENT_TYPE)
                .to_string();
            let content_length = body.len().to_string();

            request.set_header("x-content-sha256", &content_sha)?;
            request.set_header("content-type", &content_type)?;
            request.set_header("content-length", &content_length)?;
            lines.push(("x-content-sha256", content_sha));
            lines.push(("content-type", content_type));
            lines.push(("content-length", content_length));
        }

        let signing_string = lines
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join("\n");
        let header_names = lines
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" ");

        let signing_key = SigningKey::<Sha256>::new((*key).clone());
        let signature = signing_key
            .try_sign(signing_string.as_bytes())
            .map_err(|e| Error::Signing(e.to_string()))?;
        let signature = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        let authorization = format!(
            "Signature version=\"1\",keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{header_names}\",signature=\"{signature}\""
        );
        request.set_header("authorization", &authorization)
    }
}

impl RequestSigner for OciRequestSigner {
    fn sign(&self, request: &mut OutboundRequest) -> Result<()> {
        self.sign_at(request, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use rsa::pkcs1v15::VerifyingKey;
    use rsa::signature::Verifier;

    use super::*;

    const TEST_KEY: &str = include_str!("../../tests/fixtures/oci_test_key.pem");

    struct StaticProvider(Arc<RsaPrivateKey>);

    impl OciAuthProvider for StaticProvider {
        fn auth_type(&self) -> OciAuthType {
            OciAuthType::UserPrincipal
        }
        fn key_id(&self) -> Result<String> {
            Ok("tenancy/user/fp".to_string())
        }
        fn private_key(&self) -> Result<Arc<RsaPrivateKey>> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn extract(auth: &str, field: &str) -> String {
        let marker = format!("{field}=\"");
        let start = auth.find(&marker).unwrap() + marker.len();
        let end = auth[start..].find('"').unwrap() + start;
        auth[start..end].to_string()
    }

    #[test]
    fn test_post_signature_verifies() {
        let key = Arc::new(parse_private_key_pem(TEST_KEY).unwrap());
        let signer = OciRequestSigner::new(Arc::new(StaticProvider(Arc::clone(&key))));
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let body = r#"{"prompts":["hi"]}"#;
        let mut req = OutboundRequest::new(
            "POST",
            "http://localhost:8080/20231130/actions/generateText",
            &BTreeMap::new(),
            Some(body),
        )
        .unwrap();
        signer.sign_at(&mut req, now).unwrap();

        let auth = req.header_str("authorization").unwrap().to_string();
        assert_eq!(extract(&auth, "keyId"), "tenancy/user/fp");
        assert_eq!(
            extract(&auth, "headers"),
            "date (request-target) host x-content-sha256 content-type content-length"
        );
        assert_eq!(req.header_str("date"), Some("Tue, 02 Jan 2024 03:04:05 GMT"));
        assert_eq!(req.header_str("content-length"), Some(body.len().to_string().as_str()));

        let expected_string = format!(
            "date: Tue, 02 Jan 2024 03:04:05 GMT\n(request-target): post /20231130/actions/generateText\nhost: localhost:8080\nx-content-sha256: {}\ncontent-type: application/json\ncontent-length: {}",
            req.header_str("x-content-sha256").unwrap(),
            body.len()
        );
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(extract(&auth, "signature"))
            .unwrap();
        let signature = rsa::pkcs1v15::Signature::try_from(sig_bytes.as_slice()).unwrap();
        let verifying = VerifyingKey::<Sha256>::new(key.to_public_key());
        verifying
            .verify(expected_string.as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn test_get_signs_three_headers() {
        let key = Arc::new(parse_private_key_pem(TEST_KEY).unwrap());
        let signer = OciRequestSigner::new(Arc::new(StaticProvider(key)));
        let mut req =
            OutboundRequest::new("GET", "http://localhost/n/ns/b/bucket/o/model.zip", &BTreeMap::new(), None)
                .unwrap();
        signer.sign(&mut req).unwrap();
        let auth = req.header_str("authorization").unwrap();
        assert_eq!(extract(auth, "headers"), "date (request-target) host");
        assert!(req.header_str("x-content-sha256").is_none());
    }

    #[test]
    fn test_pem_supplier_is_lazy_and_retryable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("key.pem");
        let supplier = PemFileKeySupplier::new(&path);

        assert!(matches!(supplier.get(), Err(Error::KeyLoad { .. })));

        std::fs::write(&path, TEST_KEY).unwrap();
        let first = supplier.get().unwrap();
        std::fs::remove_file(&path).unwrap();
        let second = supplier.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_pem_supplier_rejects_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("key.pem");
        std::fs::write(&path, "not a key").unwrap();
        let err = PemFileKeySupplier::new(&path).get().unwrap_err();
        assert!(matches!(err, Error::KeyLoad { .. }));
    }

    #[test]
    fn test_factory_builds_user_principal_without_io() {
        let config = OciAuthConfig::UserPrincipal(UserPrincipalConfig {
            tenant_id: "t".into(),
            user_id: "u".into(),
            region: "r".into(),
            fingerprint: "f".into(),
            pemfile_path: "/does/not/exist.pem".into(),
        });
        let provider = OciAuthProviderFactory::default().build(&config);
        assert_eq!(provider.auth_type(), OciAuthType::UserPrincipal);
        assert_eq!(provider.key_id().unwrap(), "t/u/f");
        assert!(matches!(provider.private_key(), Err(Error::KeyLoad { .. })));
    }

    #[test]
    fn test_instance_principal_uses_injected_source() {
        struct Fixed(Arc<RsaPrivateKey>);
        impl AmbientSessionSource for Fixed {
            fn session(&self) -> Result<AmbientSession> {
                Ok(AmbientSession {
                    token: "tok".to_string(),
                    private_key: Arc::clone(&self.0),
                })
            }
        }

        let default = OciAuthProviderFactory::default().build(&OciAuthConfig::InstancePrincipal);
        assert!(matches!(default.key_id(), Err(Error::KeyLoad { .. })));

        let key = Arc::new(parse_private_key_pem(TEST_KEY).unwrap());
        let factory = OciAuthProviderFactory::default().with_instance_source(Arc::new(Fixed(key)));
        let provider = factory.build(&OciAuthConfig::InstancePrincipal);
        assert_eq!(provider.key_id().unwrap(), "ST$tok");
        assert_eq!(provider.auth_type(), OciAuthType::InstancePrincipal);
    }

    fn jwt(claims: serde_json::Value) -> String {
        let encode = |v: &[u8]| base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(v);
        format!(
            "{}.{}.sig",
            encode(br#"{"alg":"RS256"}"#),
            encode(claims.to_string().as_bytes())
        )
    }

    struct SessionFiles {
        _dir: tempfile::TempDir,
        token: std::path::PathBuf,
        source: ResourcePrincipalEnv,
    }

    /// A source reading from uniquely named variables that point at files,
    /// so tests never touch the real OCI variables.
    fn session_files(tag: &str) -> SessionFiles {
        let dir = tempfile::TempDir::new().unwrap();
        let token = dir.path().join("rpst");
        let pem = dir.path().join("key.pem");
        std::fs::write(&pem, TEST_KEY).unwrap();
        let token_var = format!("MLC_TEST_RPST_{tag}");
        let pem_var = format!("MLC_TEST_RP_PEM_{tag}");
        std::env::set_var(&token_var, &token);
        std::env::set_var(&pem_var, &pem);
        SessionFiles {
            _dir: dir,
            token,
            source: ResourcePrincipalEnv::with_vars(token_var, pem_var),
        }
    }

    #[test]
    fn test_token_expiry_reads_exp_claim() {
        let exp = Utc.with_ymd_and_hms(2024, 1, 2, 4, 0, 0).unwrap();
        assert_eq!(token_expiry(&jwt(serde_json::json!({ "exp": exp.timestamp() }))), Some(exp));
        assert_eq!(token_expiry(&jwt(serde_json::json!({ "sub": "x" }))), None);
        assert_eq!(token_expiry("opaque-token"), None);
    }

    #[test]
    fn test_resource_principal_session_refreshes_before_expiry() {
        let files = session_files("EXP");
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();
        let first = jwt(serde_json::json!({ "exp": (t0 + chrono::Duration::hours(1)).timestamp() }));
        let second = jwt(serde_json::json!({ "exp": (t0 + chrono::Duration::hours(3)).timestamp() }));

        std::fs::write(&files.token, &first).unwrap();
        assert_eq!(files.source.session_at(t0).unwrap().token, first);

        std::fs::write(&files.token, &second).unwrap();
        let half_hour = t0 + chrono::Duration::minutes(30);
        assert_eq!(files.source.session_at(half_hour).unwrap().token, first);

        let near_expiry = t0 + chrono::Duration::seconds(3600 - 30);
        assert_eq!(files.source.session_at(near_expiry).unwrap().token, second);
    }

    #[test]
    fn test_resource_principal_opaque_token_uses_ttl() {
        let files = session_files("TTL");
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();

        std::fs::write(&files.token, "opaque-1").unwrap();
        assert_eq!(files.source.session_at(t0).unwrap().token, "opaque-1");

        std::fs::write(&files.token, "opaque-2").unwrap();
        assert_eq!(
            files.source.session_at(t0 + chrono::Duration::minutes(4)).unwrap().token,
            "opaque-1"
        );
        assert_eq!(
            files.source.session_at(t0 + chrono::Duration::minutes(6)).unwrap().token,
            "opaque-2"
        );

        let provider = OciAuthProviderFactory::default()
            .with_resource_source(Arc::new(files.source))
            .build(&OciAuthConfig::ResourcePrincipal);
        let (key_id, _) = provider.credentials().unwrap();
        assert_eq!(key_id, "ST$opaque-2");
    }
}
