use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the inbound signature.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Optional prefix on the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the lowercase hex HMAC-SHA256 of `body` under `secret`.
///
/// Returns `None` only if the key cannot be used by the MAC.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Render the full header value (`sha256=<hex>`) a sender would attach.
pub fn signature_header(secret: &[u8], body: &[u8]) -> Option<String> {
    compute_signature(secret, body).map(|hex| format!("{SIGNATURE_PREFIX}{hex}"))
}

/// Verify an inbound signature header against the exact raw body.
///
/// A missing header, a malformed value, or an unusable key all yield
/// `false`. The comparison against the computed digest is constant-time.
pub fn verify_signature(body: &[u8], signature: Option<&str>, secret: &[u8]) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let provided = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);

    let Some(expected) = compute_signature(secret, body) else {
        return false;
    };

    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}
