//! HMAC signing for outbound webhook posts.
//!
//! Every delivery carries a signature over `"{timestamp}.{body}"` so the
//! receiver can check both authenticity and freshness. The verifier half
//! lives here too, used by the tests and published for endpoint owners.

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const ID_HEADER: &str = "X-Webhook-ID";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";
pub const MAX_ATTEMPTS_HEADER: &str = "X-Webhook-Max-Attempts";

/// Hex-encoded HMAC-SHA256 over `"{timestamp}.{payload}"`.
pub fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The `X-Webhook-Signature` value: `sha256=<hex>`.
pub fn header_value(secret: &str, timestamp: i64, payload: &str) -> String {
    format!("sha256={}", sign(secret, timestamp, payload))
}

/// Receiver-side check. The comparison is constant-time and the
/// timestamp must be within `tolerance_secs` of now; anything off,
/// including malformed headers, returns false.
pub fn verify(
    secret: &str,
    signature: &str,
    timestamp: &str,
    payload: &str,
    tolerance_secs: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (Utc::now().timestamp() - ts).abs() > tolerance_secs {
        return false;
    }

    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(raw) = hex::decode(hex_sig) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(format!("{ts}.{payload}").as_bytes());
    mac.verify_slice(&raw).is_ok()
}

/// Identifier for one delivery attempt: `YYYYMMDDHHMMSS-<16 hex chars>`.
pub fn delivery_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), hex::encode(bytes))
}
