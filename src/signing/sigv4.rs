//! AWS Signature Version 4.
//!
//! Implements the header-based SigV4 flow with `hmac` + `sha2`, without the
//! AWS SDK:
//!
//! ```text
//! CanonicalRequest = METHOD \n URI \n QUERY \n HEADERS \n SIGNED_HEADERS \n HEX(SHA256(body))
//! StringToSign     = "AWS4-HMAC-SHA256" \n amz_date \n scope \n HEX(SHA256(CanonicalRequest))
//! Signature        = HEX(HMAC(kSigning, StringToSign))
//! ```
//!
//! Signed headers are `host`, `x-amz-content-sha256`, `x-amz-date`,
//! `x-amz-security-token` (temporary credentials only), and `content-type`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use ml_connector_core::auth::AwsCredentials;
use ml_connector_core::{Error, Result};
use sha2::{Digest, Sha256};

use super::{OutboundRequest, RequestSigner};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

pub struct SigV4Signer {
    credentials: AwsCredentials,
}

impl SigV4Signer {
    pub fn new(credentials: AwsCredentials) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &AwsCredentials {
        &self.credentials
    }

    /// Sign `request` as of `now`.
    pub fn sign_at(&self, request: &mut OutboundRequest, now: DateTime<Utc>) -> Result<()> {
        let creds = &self.credentials;
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let payload_hash = hex_sha256(request.body().unwrap_or_default().as_bytes());

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), request.host_header()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        if let Some(content_type) = request.header_str("content-type") {
            headers.push(("content-type".to_string(), content_type.trim().to_string()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method().as_str(),
            canonical_uri(request, &creds.service_name),
            canonical_query(request),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, creds.region, creds.service_name
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &creds.secret_key,
            &date_stamp,
            &creds.region,
            &creds.service_name,
        )?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, creds.access_key, scope, signed_headers, signature
        );

        request.set_header("x-amz-date", &amz_date)?;
        request.set_header("x-amz-content-sha256", &payload_hash)?;
        if let Some(token) = &creds.session_token {
            request.set_header("x-amz-security-token", token)?;
        }
        request.set_header("authorization", &authorization)?;
        Ok(())
    }
}

impl RequestSigner for SigV4Signer {
    fn sign(&self, request: &mut OutboundRequest) -> Result<()> {
        self.sign_at(request, Utc::now())
    }

    // HMAC over in-memory credentials.
    fn may_block(&self) -> bool {
        false
    }
}

/// S3 signs the path as sent; every other service expects each segment
/// encoded once more.
fn canonical_uri(request: &OutboundRequest, service: &str) -> String {
    let path = request.url().path();
    if path.is_empty() {
        return "/".to_string();
    }
    if service == "s3" {
        return path.to_string();
    }
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(request: &OutboundRequest) -> String {
    let mut pairs: Vec<(String, String)> = request
        .url()
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Signing(format!("hmac key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}
