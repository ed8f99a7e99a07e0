//! AWS Signature Version 4 for path-style S3 requests.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::StorageError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SigningRequest<'a> {
    pub method: &'a str,
    /// `host[:port]` exactly as sent in the `Host` header.
    pub host: &'a str,
    /// Already-encoded absolute path.
    pub path: &'a str,
    pub payload_hash: &'a str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
}

pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Percent-encodes everything but RFC 3986 unreserved characters.
pub fn uri_encode(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

/// Encoded path of `bucket` or of `key` within it.
pub fn object_path(bucket: &str, key: Option<&str>) -> String {
    let mut path = format!("/{}", uri_encode(bucket));
    if let Some(key) = key {
        for segment in key.split('/') {
            path.push('/');
            path.push_str(&uri_encode(segment));
        }
    }
    path
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>, StorageError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| StorageError::Signing(e.to_string()))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn sign(
    credentials: &Credentials,
    request: &SigningRequest<'_>,
) -> Result<SignedHeaders, StorageError> {
    let amz_date = request.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = request.timestamp.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/s3/aws4_request", credentials.region);

    let canonical_request = format!(
        "{}\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
        request.method,
        request.path,
        request.host,
        request.payload_hash,
        amz_date,
        SIGNED_HEADERS,
        request.payload_hash
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        payload_hash(canonical_request.as_bytes())
    );

    let secret = format!("AWS4{}", credentials.secret_key);
    let k_date = hmac(secret.as_bytes(), &date)?;
    let k_region = hmac(&k_date, &credentials.region)?;
    let k_service = hmac(&k_region, "s3")?;
    let k_signing = hmac(&k_service, "aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, &string_to_sign)?);

    Ok(SignedHeaders {
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, \
             Signature={signature}",
            credentials.access_key
        ),
        amz_date,
        content_sha256: request.payload_hash.to_string(),
    })
}
