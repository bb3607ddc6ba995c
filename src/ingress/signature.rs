//! Webhook payload authentication
//!
//! GitHub signs every delivery with HMAC-SHA256 over the raw body and sends
//! the hex digest in `X-Hub-Signature-256`. Verification must run against
//! the exact bytes received, before any JSON decoding.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the delivery signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Verify a delivery signature against the shared secret.
///
/// The comparison is constant-time. Any malformed header (missing, wrong
/// scheme, bad hex) fails closed.
pub fn verify(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(digest) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&digest).is_ok()
}

/// Sign a body the way GitHub does
#[cfg(test)]
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
