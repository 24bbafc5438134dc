//! Carrier webhook signature validation.
//!
//! The carrier signs every webhook with HMAC-SHA1 over the full request URL
//! followed by the form fields sorted by name, keyed by the account auth
//! token, and sends the base64 digest in a request header.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Compute the expected signature for a webhook request.
///
/// `params` are the decoded form fields; ordering of the input slice does
/// not matter.
pub fn compute(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut data = String::from(url);
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }

    // HMAC accepts keys of any length, so construction cannot fail.
    let mac = HmacSha1::new_from_slice(auth_token.as_bytes());
    match mac {
        Ok(mut mac) => {
            mac.update(data.as_bytes());
            BASE64.encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

/// Verify a webhook signature against the raw form body.
///
/// Uses the MAC's constant-time comparison; any decode failure counts as a
/// mismatch.
pub fn verify(auth_token: &str, url: &str, raw_body: &[u8], provided: &str) -> bool {
    let params: Vec<(String, String)> = match serde_urlencoded::from_bytes(raw_body) {
        Ok(params) => params,
        Err(_) => return false,
    };

    let Ok(expected) = BASE64.decode(provided) else {
        return false;
    };

    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut data = String::from(url);
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }

    match HmacSha1::new_from_slice(auth_token.as_bytes()) {
        Ok(mut mac) => {
            mac.update(data.as_bytes());
            mac.verify_slice(&expected).is_ok()
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "test_auth_token";
    const URL: &str = "https://gw.example.com/sms/inbound";

    fn sample_params() -> Vec<(String, String)> {
        vec![
            ("From".to_string(), "+15551234567".to_string()),
            ("Body".to_string(), "hi".to_string()),
            ("MessageSid".to_string(), "SMabc".to_string()),
        ]
    }

    #[test]
    fn test_signature_roundtrip() {
        let params = sample_params();
        let sig = compute(TOKEN, URL, &params);
        let body = serde_urlencoded::to_string(&params).unwrap();
        assert!(verify(TOKEN, URL, body.as_bytes(), &sig));
    }

    #[test]
    fn test_signature_is_order_independent() {
        let mut params = sample_params();
        let sig = compute(TOKEN, URL, &params);
        params.reverse();
        assert_eq!(compute(TOKEN, URL, &params), sig);
    }

    #[test]
    fn test_signature_rejects_wrong_token() {
        let params = sample_params();
        let sig = compute("other_token", URL, &params);
        let body = serde_urlencoded::to_string(&params).unwrap();
        assert!(!verify(TOKEN, URL, body.as_bytes(), &sig));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let params = sample_params();
        let sig = compute(TOKEN, URL, &params);
        let mut tampered = params.clone();
        tampered[1].1 = "transfer all funds".to_string();
        let body = serde_urlencoded::to_string(&tampered).unwrap();
        assert!(!verify(TOKEN, URL, body.as_bytes(), &sig));
    }

    #[test]
    fn test_signature_rejects_wrong_url() {
        let params = sample_params();
        let sig = compute(TOKEN, URL, &params);
        let body = serde_urlencoded::to_string(&params).unwrap();
        assert!(!verify(
            TOKEN,
            "https://gw.example.com/sms/status",
            body.as_bytes(),
            &sig
        ));
    }

    #[test]
    fn test_signature_rejects_invalid_base64() {
        let params = sample_params();
        let body = serde_urlencoded::to_string(&params).unwrap();
        assert!(!verify(TOKEN, URL, body.as_bytes(), "!!not-base64!!"));
    }
}
