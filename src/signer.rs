//! HMAC-SHA256 signing of verification responses.
//!
//! The signed message is
//!
//! ```text
//! canonical_json(payload) || decimal(timestamp) || secret
//! ```
//!
//! keyed with the same secret and rendered as lowercase hex. The canonical
//! form is `serde_json`'s compact output of the payload struct, whose fields
//! serialize in declaration order, so the server and any client holding the
//! secret derive identical bytes.
//!
//! Binding the timestamp into the tag lets a client reject a replayed
//! response by checking the timestamp against its own clock
//! ([`Signer::verify_fresh`]).

use ring::hmac;
use serde::Serialize;

use crate::errors::{ActivationError, ActivationResult};

/// Holds the HMAC key derived from the process-wide secret.
///
/// Built once at startup and shared immutably; there is no way to swap the
/// secret on a live instance.
#[derive(Clone)]
pub struct Signer {
    key: hmac::Key,
    secret: Vec<u8>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> ActivationResult<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(ActivationError::Signing(
                "signing secret must not be empty".to_string(),
            ));
        }

        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            secret: secret.to_vec(),
        })
    }

    fn message<T: Serialize>(&self, payload: &T, timestamp: i64) -> ActivationResult<Vec<u8>> {
        let mut message = serde_json::to_vec(payload)
            .map_err(|e| ActivationError::Signing(format!("failed to canonicalize payload: {e}")))?;
        message.extend_from_slice(timestamp.to_string().as_bytes());
        message.extend_from_slice(&self.secret);
        Ok(message)
    }

    /// Compute the hex tag for `payload` at `timestamp`.
    pub fn sign<T: Serialize>(&self, payload: &T, timestamp: i64) -> ActivationResult<String> {
        let message = self.message(payload, timestamp)?;
        let tag = hmac::sign(&self.key, &message);
        Ok(hex::encode(tag.as_ref()))
    }

    /// Check `signature` against `payload` and `timestamp` in constant time.
    ///
    /// Malformed hex is treated as a mismatch.
    pub fn verify<T: Serialize>(
        &self,
        payload: &T,
        timestamp: i64,
        signature: &str,
    ) -> ActivationResult<bool> {
        let Ok(tag) = hex::decode(signature) else {
            return Ok(false);
        };
        let message = self.message(payload, timestamp)?;
        Ok(hmac::verify(&self.key, &message, &tag).is_ok())
    }

    /// Like [`Signer::verify`], but also requires `timestamp` to be within
    /// `max_skew_secs` of `now`.
    pub fn verify_fresh<T: Serialize>(
        &self,
        payload: &T,
        timestamp: i64,
        signature: &str,
        now: i64,
        max_skew_secs: i64,
    ) -> ActivationResult<bool> {
        if (now - timestamp).abs() > max_skew_secs {
            return Ok(false);
        }
        self.verify(payload, timestamp, signature)
    }
}

/// One-shot helper matching the documented contract
/// `sign(payload, timestamp, secret) -> tag`.
pub fn sign<T: Serialize>(payload: &T, timestamp: i64, secret: &str) -> ActivationResult<String> {
    Signer::new(secret)?.sign(payload, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Payload {
        activation_id: i64,
        devices_used: i64,
        device_limit: Option<i64>,
    }

    fn payload() -> Payload {
        Payload {
            activation_id: 7,
            devices_used: 1,
            device_limit: Some(2),
        }
    }

    #[test]
    fn tag_is_lowercase_hex_sha256() {
        let tag = sign(&payload(), 1_700_000_000, "secret").unwrap();
        assert_eq!(tag.len(), 64);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn matches_independent_hmac_computation() {
        let message = format!(
            "{}{}{}",
            r#"{"activation_id":7,"devices_used":1,"device_limit":2}"#,
            1_700_000_000,
            "secret"
        );
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"secret");
        let expected = hex::encode(hmac::sign(&key, message.as_bytes()).as_ref());

        assert_eq!(sign(&payload(), 1_700_000_000, "secret").unwrap(), expected);
    }

    #[test]
    fn verify_round_trip() {
        let signer = Signer::new("secret").unwrap();
        let tag = signer.sign(&payload(), 42).unwrap();
        assert!(signer.verify(&payload(), 42, &tag).unwrap());
    }

    #[test]
    fn verify_detects_tampering() {
        let signer = Signer::new("secret").unwrap();
        let tag = signer.sign(&payload(), 42).unwrap();

        let mut tampered = payload();
        tampered.devices_used = 2;
        assert!(!signer.verify(&tampered, 42, &tag).unwrap());
        assert!(!signer.verify(&payload(), 43, &tag).unwrap());
        assert!(!signer.verify(&payload(), 42, "not-hex").unwrap());

        let other = Signer::new("other-secret").unwrap();
        assert!(!other.verify(&payload(), 42, &tag).unwrap());
    }

    #[test]
    fn verify_fresh_rejects_stale_timestamps() {
        let signer = Signer::new("secret").unwrap();
        let tag = signer.sign(&payload(), 1_000).unwrap();
        assert!(signer.verify_fresh(&payload(), 1_000, &tag, 1_030, 60).unwrap());
        assert!(!signer.verify_fresh(&payload(), 1_000, &tag, 1_100, 60).unwrap());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(Signer::new("").is_err());
    }
}
