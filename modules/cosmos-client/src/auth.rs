//! Master-key request signing.
//!
//! Cosmos authorizes REST calls with an HMAC-SHA256 over
//! `verb\nresourceType\nresourceLink\ndate\n\n` (verb, resource type and
//! date lowercased), keyed by the base64-decoded master key.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CosmosError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Current time in the RFC 1123 format the `x-ms-date` header requires.
pub fn rfc1123_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn sign_request(
    master_key: &str,
    verb: &str,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> Result<String> {
    let key = base64::engine::general_purpose::STANDARD
        .decode(master_key)
        .map_err(|e| CosmosError::Auth(format!("master key is not valid base64: {e}")))?;

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase(),
    );

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| CosmosError::Auth(format!("hmac init failed: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(percent_encode(&format!(
        "type=master&ver=1.0&sig={signature}"
    )))
}

/// Percent-encode the auth token (the signature's `+`, `/`, `=` must not
/// reach the header raw).
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_fixed_date() {
        let key = base64::engine::general_purpose::STANDARD.encode(b"test-master-key");
        let a = sign_request(&key, "GET", "docs", "dbs/db/colls/c/docs/1", "mon, 01 jan 2024 00:00:00 gmt").unwrap();
        let b = sign_request(&key, "get", "DOCS", "dbs/db/colls/c/docs/1", "Mon, 01 Jan 2024 00:00:00 GMT").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_base64_key_is_rejected() {
        let err = sign_request("not base64 !!!", "get", "docs", "x", "d").unwrap_err();
        assert!(matches!(err, CosmosError::Auth(_)));
    }

    #[test]
    fn percent_encoding_escapes_signature_chars() {
        assert_eq!(percent_encode("a+b/c="), "a%2Bb%2Fc%3D");
    }
}
