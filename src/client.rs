//! Client for the Keyforge verification endpoint.
//!
//! The client normalises and format-checks a code before sending it, posts
//! the verification request, and authenticates a successful response with the
//! shared secret. A response whose signature does not match is treated as a
//! transport-level attack and surfaces as `ActivationError::Signing`, never as
//! an activation.
//!
//! # Example
//!
//! ```rust,ignore
//! use keyforge::client::{ActivationClient, ActivationOutcome};
//!
//! let client = ActivationClient::new("https://keys.example.com", "demo", "shared-secret")?
//!     .with_max_skew(300);
//!
//! match client.verify("7K3M-Q9ZD-R2XA-HT5W", "device-1", None).await? {
//!     ActivationOutcome::Activated(data) => println!("{} uses left", data.remaining_uses),
//!     ActivationOutcome::Rejected { code, message } => println!("{code}: {message}"),
//! }
//! ```

use chrono::Utc;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::code_generator::{normalize_code, validate_code_format};
use crate::errors::{ActivationError, ActivationResult};
use crate::protocol::{ActivationData, VerificationRequest, VerificationResponse, VerifyErrorCode};
use crate::signer::Signer;

/// Result of a verification round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The server admitted the device and the response signature checked out.
    Activated(ActivationData),
    /// The server refused the code.
    Rejected {
        code: VerifyErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct ActivationClient {
    http: Client,
    base_url: String,
    app_id: String,
    signer: Signer,
    max_skew_secs: Option<i64>,
}

impl ActivationClient {
    pub fn new(base_url: &str, app_id: &str, secret: &str) -> ActivationResult<Self> {
        Ok(Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            signer: Signer::new(secret)?,
            max_skew_secs: None,
        })
    }

    /// Reject signed responses whose timestamp is more than `secs` away from
    /// the local clock.
    pub fn with_max_skew(mut self, secs: i64) -> Self {
        self.max_skew_secs = Some(secs);
        self
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Verify `code` for `device_id`.
    pub async fn verify(
        &self,
        code: &str,
        device_id: &str,
        device_info: Option<Map<String, Value>>,
    ) -> ActivationResult<ActivationOutcome> {
        let code = normalize_code(code);
        if !validate_code_format(&code) {
            return Err(ActivationError::Validation(format!(
                "malformed activation code: {code}"
            )));
        }

        let request = VerificationRequest {
            code,
            app_id: self.app_id.clone(),
            device_id: device_id.to_string(),
            device_info,
            timestamp: Utc::now().timestamp(),
        };

        let url = format!("{}/api/activation/verify", self.base_url);
        debug!(url = %url, device_id = %device_id, "Sending verification request");

        let response = self.http.post(&url).json(&request).send().await?;
        let status = response.status();
        let body: VerificationResponse = response.json().await.map_err(|e| {
            ActivationError::Server(format!("unexpected response (HTTP {status}): {e}"))
        })?;

        self.authenticate(&body, Utc::now().timestamp())
    }

    /// Check a response's signature and turn it into an outcome.
    pub fn authenticate(
        &self,
        response: &VerificationResponse,
        now: i64,
    ) -> ActivationResult<ActivationOutcome> {
        if !response.success {
            return Ok(ActivationOutcome::Rejected {
                code: response.code.unwrap_or(VerifyErrorCode::InternalError),
                message: response.message.clone(),
            });
        }

        let data = response.data.as_ref().ok_or_else(|| {
            ActivationError::Signing("successful response carries no payload".to_string())
        })?;

        let authentic = match self.max_skew_secs {
            Some(skew) => self.signer.verify_fresh(
                data,
                response.timestamp,
                &response.signature,
                now,
                skew,
            )?,
            None => self
                .signer
                .verify(data, response.timestamp, &response.signature)?,
        };

        if !authentic {
            warn!(
                activation_id = data.activation_id,
                "Rejected verification response with bad or stale signature"
            );
            return Err(ActivationError::Signing(
                "response signature did not verify".to_string(),
            ));
        }

        Ok(ActivationOutcome::Activated(data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> ActivationData {
        ActivationData {
            activation_id: 4,
            devices_used: 1,
            device_limit: Some(3),
            expires_at: None,
            remaining_uses: 2,
            created_at: 1_700_000_000,
        }
    }

    fn signed(secret: &str, timestamp: i64) -> VerificationResponse {
        let signature = Signer::new(secret).unwrap().sign(&data(), timestamp).unwrap();
        VerificationResponse {
            success: true,
            message: "Activation successful".to_string(),
            data: Some(data()),
            signature,
            timestamp,
            code: None,
        }
    }

    fn client() -> ActivationClient {
        ActivationClient::new("http://localhost:8080/", "demo", "secret").unwrap()
    }

    #[test]
    fn base_url_is_trimmed() {
        assert_eq!(client().base_url, "http://localhost:8080");
    }

    #[test]
    fn authentic_response_is_accepted() {
        let outcome = client().authenticate(&signed("secret", 100), 100).unwrap();
        assert_eq!(outcome, ActivationOutcome::Activated(data()));
    }

    #[test]
    fn forged_response_is_an_error() {
        let mut response = signed("secret", 100);
        if let Some(d) = response.data.as_mut() {
            d.remaining_uses = 999;
        }
        assert!(matches!(
            client().authenticate(&response, 100),
            Err(ActivationError::Signing(_))
        ));

        assert!(client().authenticate(&signed("other", 100), 100).is_err());
    }

    #[test]
    fn stale_response_is_rejected_when_skew_is_set() {
        let strict = client().with_max_skew(60);
        assert!(strict.authenticate(&signed("secret", 100), 130).is_ok());
        assert!(strict.authenticate(&signed("secret", 100), 1_000).is_err());
        assert!(client().authenticate(&signed("secret", 100), 1_000).is_ok());
    }

    #[test]
    fn failure_response_is_a_rejection() {
        let response = VerificationResponse::failure(VerifyErrorCode::CodeRevoked, 5);
        assert_eq!(
            client().authenticate(&response, 5).unwrap(),
            ActivationOutcome::Rejected {
                code: VerifyErrorCode::CodeRevoked,
                message: "Activation code is revoked".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn malformed_code_is_not_sent() {
        let err = client().verify("nope", "d1", None).await.unwrap_err();
        assert!(matches!(err, ActivationError::Validation(_)));
    }
}
