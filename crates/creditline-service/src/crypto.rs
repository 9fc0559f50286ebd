//! Webhook signature verification.
//!
//! Paddle signs each delivery with a `Paddle-Signature` header of the form
//! `ts=<unix seconds>;h1=<hex hmac>`, where the HMAC-SHA256 is computed over
//! `"<ts>:<raw body>"` with the notification secret. More than one `h1` may be
//! present during secret rotation; any match is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Why a webhook signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The header is not `ts=...;h1=...`.
    #[error("malformed signature header")]
    Malformed,

    /// The timestamp is outside the accepted window.
    #[error("signature timestamp outside tolerance ({age_seconds}s)")]
    Expired {
        /// Distance from now, in seconds.
        age_seconds: i64,
    },

    /// No signature matched.
    #[error("signature mismatch")]
    Mismatch,

    /// The secret cannot key an HMAC.
    #[error("invalid webhook secret")]
    InvalidSecret,
}

/// Compute HMAC-SHA256 and return the hex-encoded result.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidSecret`] if the key is rejected.
pub fn hmac_sha256_hex(secret: &str, message: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison to prevent timing attacks.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// A parsed `Paddle-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Signing time, unix seconds.
    pub timestamp: i64,
    /// Candidate signatures.
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse `ts=<unix>;h1=<hex>[;h1=<hex>...]`.
    ///
    /// # Errors
    ///
    /// [`SignatureError::Malformed`] if the timestamp or every `h1` is missing.
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(';') {
            match part.trim().split_once('=') {
                Some(("ts", value)) => {
                    timestamp = Some(value.parse().map_err(|_| SignatureError::Malformed)?);
                }
                Some(("h1", value)) if !value.is_empty() => signatures.push(value.to_string()),
                _ => {}
            }
        }
        match timestamp {
            Some(timestamp) if !signatures.is_empty() => Ok(Self {
                timestamp,
                signatures,
            }),
            _ => Err(SignatureError::Malformed),
        }
    }
}

/// Sign `body` at `timestamp` the way Paddle does. Used by tests and tooling.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidSecret`] if the key is rejected.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let mut message = format!("{timestamp}:").into_bytes();
    message.extend_from_slice(body);
    let h1 = hmac_sha256_hex(secret, &message)?;
    Ok(format!("ts={timestamp};h1={h1}"))
}

/// Verify a webhook delivery.
///
/// # Errors
///
/// Returns the reason the signature was rejected.
pub fn verify_signature(
    header: &str,
    body: &[u8],
    secret: &str,
    tolerance_seconds: u64,
    now: i64,
) -> Result<(), SignatureError> {
    let parsed = SignatureHeader::parse(header)?;

    let age_seconds = now - parsed.timestamp;
    if age_seconds.unsigned_abs() > tolerance_seconds {
        return Err(SignatureError::Expired { age_seconds });
    }

    let mut message = format!("{}:", parsed.timestamp).into_bytes();
    message.extend_from_slice(body);
    let expected = hmac_sha256_hex(secret, &message)?;

    if parsed
        .signatures
        .iter()
        .any(|candidate| constant_time_eq(candidate, &expected))
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "pdl_ntfset_test_secret";
    const BODY: &[u8] = br#"{"event_type":"transaction.completed"}"#;

    #[test]
    fn hmac_sha256_produces_correct_length() {
        let result = hmac_sha256_hex("key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(result.len(), 64);
    }

    #[test]
    fn constant_time_eq_compares_contents() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn signed_payload_verifies() {
        let header = sign(SECRET, 1_700_000_000, BODY).unwrap();
        assert!(verify_signature(&header, BODY, SECRET, 300, 1_700_000_100).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign(SECRET, 1_700_000_000, BODY).unwrap();
        assert_eq!(
            verify_signature(&header, b"{}", SECRET, 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(&header, BODY, "other", 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_and_future_timestamps_are_rejected() {
        let header = sign(SECRET, 1_700_000_000, BODY).unwrap();
        assert!(matches!(
            verify_signature(&header, BODY, SECRET, 300, 1_700_000_301),
            Err(SignatureError::Expired { age_seconds: 301 })
        ));
        assert!(matches!(
            verify_signature(&header, BODY, SECRET, 300, 1_699_999_000),
            Err(SignatureError::Expired { .. })
        ));
    }

    #[test]
    fn rotated_secrets_accept_any_match() {
        let good = sign(SECRET, 10, BODY).unwrap();
        let h1 = good.split_once(";h1=").unwrap().1;
        let header = format!("ts=10;h1=deadbeef;h1={h1}");
        assert!(verify_signature(&header, BODY, SECRET, 5, 12).is_ok());
    }

    #[test]
    fn malformed_headers() {
        assert_eq!(SignatureHeader::parse("h1=abc"), Err(SignatureError::Malformed));
        assert_eq!(SignatureHeader::parse("ts=1"), Err(SignatureError::Malformed));
        assert_eq!(SignatureHeader::parse("ts=x;h1=abc"), Err(SignatureError::Malformed));
    }
}
