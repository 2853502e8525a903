//! AWS Signature Version 4 primitives.
//!
//! Pure functions: canonical request, string to sign, signing key derivation.
//! No clocks or credential lookups happen here.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

use crate::types::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
pub const SCOPE_DATE_FORMAT: &str = "%Y%m%d";

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::internal(format!("hmac key rejected: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`
pub fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

pub fn signature(signing_key: &[u8], string_to_sign: &str) -> Result<String> {
    Ok(hex(&hmac(signing_key, string_to_sign.as_bytes())?))
}

/// RFC 3986 percent-encoding of everything except unreserved characters.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Path as sent on the wire, encoded once more (non-S3 services expect the
/// double-encoded form).
fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        uri_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k, true), uri_encode(&v, true)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Host header value as the server will see it.
pub fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::validation("url has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sorted, lower-cased headers participating in the signature.
pub fn canonical_headers(url: &Url, headers: &HeaderMap) -> Result<BTreeMap<String, String>> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if name == "authorization" || name == "connection" {
            continue;
        }
        let value = value
            .to_str()
            .map_err(|_| Error::validation(format!("header {} is not valid ascii", name)))?;
        let value = normalize_header_value(value);
        out.entry(name)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out.entry("host".to_string()).or_insert(host_header(url)?);
    Ok(out)
}

/// Canonical request plus the `SignedHeaders` list.
pub fn canonical_request(
    method: &str,
    url: &Url,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
) -> (String, String) {
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
    let header_block: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri(url),
        canonical_query(url),
        header_block,
        signed_headers,
        payload_hash
    );
    (canonical, signed_headers)
}

pub fn credential_scope(at: DateTime<Utc>, region: &str, service: &str) -> String {
    format!(
        "{}/{}/{}/aws4_request",
        at.format(SCOPE_DATE_FORMAT),
        region,
        service
    )
}

pub fn string_to_sign(at: DateTime<Utc>, scope: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        at.format(AMZ_DATE_FORMAT),
        scope,
        sha256_hex(canonical_request.as_bytes())
    )
}
