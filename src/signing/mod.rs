//! Request signing for the exchange's authenticated REST endpoints.
//!
//! The signature is an HMAC-SHA256 over the exact URL-encoded query string
//! that is sent on the wire, hex encoded in lower case.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("could not encode query string: {0}")]
    Encode(#[from] serde_urlencoded::ser::Error),
    #[error("invalid hmac key: {0}")]
    Key(String),
}

/// Serializes `params` in the order given, URL-encoding keys and values.
pub fn canonical_query(params: &[(&str, String)]) -> Result<String, SignError> {
    Ok(serde_urlencoded::to_string(params)?)
}

/// Signs `params` with `secret` and returns the hex digest.
pub fn sign(params: &[(&str, String)], secret: &[u8]) -> Result<String, SignError> {
    let query = canonical_query(params)?;
    signature_hex(secret, &query)
}

/// Signs an already serialized query string.
pub fn signature_hex(secret: &[u8], payload: &str) -> Result<String, SignError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| SignError::Key(e.to_string()))?;
    mac.update(payload.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut signature = String::with_capacity(digest.len() * 2);
    append_hex_lower(&digest, &mut signature);
    Ok(signature)
}

/// Builds the final signed query: canonical params followed by `&signature=<hex>`.
pub fn signed_query(params: &[(&str, String)], secret: &[u8]) -> Result<String, SignError> {
    let mut query = canonical_query(params)?;
    let signature = signature_hex(secret, &query)?;
    query.reserve("&signature=".len() + signature.len());
    query.push_str("&signature=");
    query.push_str(&signature);
    Ok(query)
}

fn append_hex_lower(bytes: &[u8], out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
}
