//! Approval tokens for high-risk actions.
//!
//! Tokens are HMAC-SHA256 based, bound to an (action, principal,
//! issued-at) triple, expire after a configurable TTL, and are single-use.
//! Format: `warden_ap_<issued_ms>_<hmac_hex>` where the HMAC is computed
//! over `<action>:<principal>:<issued_ms>`.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify warden approval tokens.
const TOKEN_PREFIX: &str = "warden_ap_";

/// Default token lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Errors that can occur during approval-token operations.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("invalid approval token format: {0}")]
    InvalidFormat(String),

    #[error("approval token HMAC verification failed")]
    HmacMismatch,

    #[error("approval token expired")]
    Expired,

    #[error("approval token already used")]
    AlreadyUsed,

    #[error("missing approval secret")]
    MissingSecret,
}

/// Configuration for approval-token issuance and redemption.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
    /// How long a token stays redeemable after issuance.
    pub ttl: Duration,
}

impl ApprovalConfig {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Build a config from the `WARDEN_APPROVAL_SECRET` environment
    /// variable (hex-encoded).
    pub fn from_env() -> Result<Self, ApprovalError> {
        let secret_hex =
            std::env::var("WARDEN_APPROVAL_SECRET").map_err(|_| ApprovalError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            ApprovalError::InvalidFormat(format!("WARDEN_APPROVAL_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Issues and redeems single-use approval tokens.
pub struct ApprovalService {
    config: ApprovalConfig,
    /// HMAC hex of every redeemed token; redemption is single-use.
    consumed: Mutex<HashSet<String>>,
}

impl ApprovalService {
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            config,
            consumed: Mutex::new(HashSet::new()),
        }
    }

    /// Issue an approval token bound to (action, principal, now).
    pub fn issue(&self, action: &str, principal: &str) -> String {
        let issued_ms = Utc::now().timestamp_millis();
        let mac = compute_hmac(
            &self.config.secret,
            message(action, principal, issued_ms).as_bytes(),
        );
        format!("{TOKEN_PREFIX}{issued_ms}_{}", hex::encode(mac))
    }

    /// Redeem a token for the given action and principal.
    ///
    /// Checks, in order: format, HMAC (constant-time), expiry, reuse.
    /// A successful redemption consumes the token.
    pub fn redeem(
        &self,
        token: &str,
        action: &str,
        principal: &str,
    ) -> Result<(), ApprovalError> {
        let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
            ApprovalError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}"))
        })?;

        let (issued_str, hmac_hex) = rest.split_once('_').ok_or_else(|| {
            ApprovalError::InvalidFormat("expected underscore between timestamp and hmac".into())
        })?;

        let issued_ms: i64 = issued_str.parse().map_err(|e| {
            ApprovalError::InvalidFormat(format!("invalid issued-at timestamp: {e}"))
        })?;

        let provided_mac = hex::decode(hmac_hex)
            .map_err(|e| ApprovalError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

        verify_hmac_constant_time(
            &self.config.secret,
            message(action, principal, issued_ms).as_bytes(),
            &provided_mac,
        )?;

        let age_ms = Utc::now().timestamp_millis() - issued_ms;
        if age_ms < 0 || age_ms as u128 > self.config.ttl.as_millis() {
            return Err(ApprovalError::Expired);
        }

        let mut consumed = self.consumed.lock().expect("approval lock poisoned");
        if !consumed.insert(hmac_hex.to_owned()) {
            return Err(ApprovalError::AlreadyUsed);
        }

        Ok(())
    }
}

fn message(action: &str, principal: &str, issued_ms: i64) -> String {
    format!("{action}:{principal}:{issued_ms}")
}

/// Compute HMAC-SHA256 over the given message with the given key.
fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verify HMAC using the `hmac` crate's constant-time comparison.
fn verify_hmac_constant_time(
    key: &[u8],
    message: &[u8],
    expected_mac: &[u8],
) -> Result<(), ApprovalError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.verify_slice(expected_mac)
        .map_err(|_| ApprovalError::HmacMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ApprovalService {
        ApprovalService::new(ApprovalConfig::new(b"approval-test-secret".to_vec()))
    }

    #[test]
    fn issue_and_redeem_roundtrip() {
        let service = service();
        let token = service.issue("deploy_production", "alice");
        service
            .redeem(&token, "deploy_production", "alice")
            .unwrap();
    }

    #[test]
    fn token_is_single_use() {
        let service = service();
        let token = service.issue("deploy_production", "alice");
        service
            .redeem(&token, "deploy_production", "alice")
            .unwrap();
        let err = service
            .redeem(&token, "deploy_production", "alice")
            .unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyUsed));
    }

    #[test]
    fn token_is_bound_to_action() {
        let service = service();
        let token = service.issue("deploy_production", "alice");
        let err = service.redeem(&token, "drop_database", "alice").unwrap_err();
        assert!(matches!(err, ApprovalError::HmacMismatch));
    }

    #[test]
    fn token_is_bound_to_principal() {
        let service = service();
        let token = service.issue("deploy_production", "alice");
        let err = service
            .redeem(&token, "deploy_production", "mallory")
            .unwrap_err();
        assert!(matches!(err, ApprovalError::HmacMismatch));
    }

    #[test]
    fn expired_token_is_rejected() {
        let service = ApprovalService::new(
            ApprovalConfig::new(b"approval-test-secret".to_vec())
                .with_ttl(Duration::from_millis(0)),
        );
        let token = service.issue("deploy", "alice");
        std::thread::sleep(Duration::from_millis(5));
        let err = service.redeem(&token, "deploy", "alice").unwrap_err();
        assert!(matches!(err, ApprovalError::Expired));
    }

    #[test]
    fn tampered_hmac_is_rejected() {
        let service = service();
        let token = service.issue("deploy", "alice");
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });
        let err = service.redeem(&tampered, "deploy", "alice").unwrap_err();
        assert!(matches!(err, ApprovalError::HmacMismatch));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = service();
        let token = issuer.issue("deploy", "alice");
        let verifier =
            ApprovalService::new(ApprovalConfig::new(b"a-different-secret".to_vec()));
        let err = verifier.redeem(&token, "deploy", "alice").unwrap_err();
        assert!(matches!(err, ApprovalError::HmacMismatch));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let service = service();
        for bad in ["", "warden_ap_", "warden_ap_abc", "nope_123_abcd", "warden_ap_12_zz!"] {
            let err = service.redeem(bad, "deploy", "alice").unwrap_err();
            assert!(
                matches!(err, ApprovalError::InvalidFormat(_)),
                "token {bad:?} should be rejected as malformed, got {err:?}"
            );
        }
    }
}
