//! Webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The MAC is
//! HMAC-SHA256 over `"<t>.<raw body>"` keyed by the endpoint secret. Several `v1`
//! entries appear while a secret is being rolled; any match is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Default replay window
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Default)]
struct SignatureHeader {
    timestamp: Option<i64>,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> SignatureHeader {
    let mut parsed = SignatureHeader::default();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => parsed.timestamp = value.parse().ok(),
            "v1" => {
                // Malformed hex can never match, skip it
                if let Ok(bytes) = hex::decode(value) {
                    parsed.signatures.push(bytes);
                }
            }
            _ => {}
        }
    }
    parsed
}

/// Verifies `header` for `payload` at time `now` (unix seconds).
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> BillingResult<()> {
    let parsed = parse_header(header);

    let timestamp = parsed.timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if parsed.signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // `t` is attacker-controlled; a difference that overflows is out of range
    let skew = now.checked_sub(timestamp).map(i64::unsigned_abs);
    if !matches!(skew, Some(skew) if skew <= tolerance_secs) {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = parsed
        .signatures
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok());

    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Builds a header value for `payload`; used by tests and local tooling.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

pub(crate) fn unix_now() -> BillingResult<i64> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .map_err(|e| BillingError::Internal(format!("System time error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_valid_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign_payload(body, SECRET, NOW).unwrap();
        assert!(verify_signature(body, &header, SECRET, 300, NOW + 10).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = sign_payload(br#"{"id":"evt_1"}"#, SECRET, NOW).unwrap();
        let result = verify_signature(br#"{"id":"evt_2"}"#, &header, SECRET, 300, NOW);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"{}";
        let header = sign_payload(body, "whsec_other", NOW).unwrap();
        assert!(verify_signature(body, &header, SECRET, 300, NOW).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let body = b"{}";
        let header = sign_payload(body, SECRET, NOW).unwrap();
        assert!(verify_signature(body, &header, SECRET, 300, NOW + 301).is_err());
        assert!(verify_signature(body, &header, SECRET, 300, NOW - 301).is_err());
    }

    #[test]
    fn test_any_v1_may_match() {
        let body = b"{}";
        let good = sign_payload(body, SECRET, NOW).unwrap();
        let good_sig = good.split_once(",v1=").unwrap().1;
        let header = format!("t={NOW},v1=deadbeef,v0=ignored,v1={good_sig}");
        assert!(verify_signature(body, &header, SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let body = b"{}";
        for t in [i64::MIN, i64::MAX, -1] {
            let header = format!("t={t},v1=00");
            let result = verify_signature(body, &header, SECRET, 300, NOW);
            assert!(
                matches!(result, Err(BillingError::WebhookSignatureInvalid)),
                "accepted t={t}"
            );
        }
        // Overflow on the other side of the subtraction
        let header = sign_payload(body, SECRET, i64::MAX).unwrap();
        assert!(verify_signature(body, &header, SECRET, 300, -2).is_err());
    }

    #[test]
    fn test_malformed_headers() {
        for header in ["", "t=abc,v1=00", "v1=00", &format!("t={NOW}")] {
            assert!(
                verify_signature(b"{}", header, SECRET, 300, NOW).is_err(),
                "accepted {header:?}"
            );
        }
    }
}
