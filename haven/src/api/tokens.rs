//! HMAC-backed access and refresh tokens, plus login lockout
//!
//! Token layout: `base64url(subject.kind.expiry) . base64url(mac)`,
//! MAC'd with HMAC-SHA-256 under the vault's api-token sub-key.
//! Verification is constant-time on the MAC.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use thiserror::Error;

use lib_crypto::SecretBuffer;

type HmacSha256 = Hmac<Sha256>;

pub const ACCESS_TTL: Duration = Duration::from_secs(15 * 60);
pub const REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Failed attempts tolerated per source within the lockout window.
pub const LOCKOUT_MAX_FAILURES: usize = 5;
pub const LOCKOUT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("wrong token kind")]
    WrongKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn label(self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }

    pub fn ttl(self) -> Duration {
        match self {
            TokenKind::Access => ACCESS_TTL,
            TokenKind::Refresh => REFRESH_TTL,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct TokenService {
    key: SecretBuffer,
}

impl TokenService {
    pub fn new(key: SecretBuffer) -> Self {
        Self { key }
    }

    fn mac(&self, payload: &str) -> Vec<u8> {
        let mut mac = self
            .key
            .expose(|k| HmacSha256::new_from_slice(k))
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Issue a token; returns `(token, expires_in_seconds)`.
    pub fn issue(&self, subject: &str, kind: TokenKind) -> (String, u64) {
        self.issue_with_ttl(subject, kind, kind.ttl())
    }

    fn issue_with_ttl(&self, subject: &str, kind: TokenKind, ttl: Duration) -> (String, u64) {
        let expiry = now_secs() + ttl.as_secs();
        let payload = format!("{subject}.{}.{expiry}", kind.label());
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(self.mac(&payload))
        );
        (token, ttl.as_secs())
    }

    /// Verify MAC, kind and expiry; returns the subject.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<String, TokenError> {
        let (payload_b64, mac_b64) = token.split_once('.').ok_or(TokenError::Invalid)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or(TokenError::Invalid)?;
        let given_mac = URL_SAFE_NO_PAD.decode(mac_b64).map_err(|_| TokenError::Invalid)?;

        let expected = SecretBuffer::from_vec(self.mac(&payload));
        if !expected.ct_eq(&given_mac) {
            return Err(TokenError::Invalid);
        }

        let mut parts = payload.rsplitn(3, '.');
        let expiry: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(TokenError::Invalid)?;
        let label = parts.next().ok_or(TokenError::Invalid)?;
        let subject = parts.next().ok_or(TokenError::Invalid)?.to_string();

        if label != kind.label() {
            return Err(TokenError::WrongKind);
        }
        if expiry <= now_secs() {
            return Err(TokenError::Expired);
        }
        Ok(subject)
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenService")
    }
}

/// Per-source failed-login accounting with a sliding window.
#[derive(Debug, Default)]
pub struct LoginLimiter {
    failures: Mutex<HashMap<String, Vec<Instant>>>,
}

impl LoginLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, source: &str) -> bool {
        let mut failures = self.failures.lock();
        let Some(attempts) = failures.get_mut(source) else {
            return false;
        };
        attempts.retain(|at| at.elapsed() < LOCKOUT_WINDOW);
        attempts.len() >= LOCKOUT_MAX_FAILURES
    }

    pub fn record_failure(&self, source: &str) {
        self.failures
            .lock()
            .entry(source.to_string())
            .or_default()
            .push(Instant::now());
    }

    pub fn clear(&self, source: &str) {
        self.failures.lock().remove(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::random_bytes;

    fn service() -> TokenService {
        TokenService::new(SecretBuffer::from_vec(random_bytes(32)))
    }

    #[test]
    fn issue_verify_roundtrip() {
        let tokens = service();
        let (token, expires_in) = tokens.issue("node-1", TokenKind::Access);
        assert_eq!(expires_in, ACCESS_TTL.as_secs());
        assert_eq!(tokens.verify(&token, TokenKind::Access).unwrap(), "node-1");
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let tokens = service();
        let (token, _) = tokens.issue("node-1", TokenKind::Refresh);
        assert_eq!(
            tokens.verify(&token, TokenKind::Access).unwrap_err(),
            TokenError::WrongKind
        );
        assert!(tokens.verify(&token, TokenKind::Refresh).is_ok());
    }

    #[test]
    fn tampered_token_is_invalid() {
        let tokens = service();
        let (token, _) = tokens.issue("node-1", TokenKind::Access);
        let mut tampered = token.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        let tampered = String::from_utf8(tampered).unwrap();
        assert_eq!(
            tokens.verify(&tampered, TokenKind::Access).unwrap_err(),
            TokenError::Invalid
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = service();
        let (token, _) = tokens.issue_with_ttl("node-1", TokenKind::Access, Duration::ZERO);
        assert_eq!(
            tokens.verify(&token, TokenKind::Access).unwrap_err(),
            TokenError::Expired
        );
    }

    #[test]
    fn keys_are_not_interchangeable() {
        let a = service();
        let b = service();
        let (token, _) = a.issue("node-1", TokenKind::Access);
        assert_eq!(
            b.verify(&token, TokenKind::Access).unwrap_err(),
            TokenError::Invalid
        );
    }

    #[test]
    fn lockout_after_five_failures() {
        let limiter = LoginLimiter::new();
        for _ in 0..LOCKOUT_MAX_FAILURES {
            assert!(!limiter.is_locked("127.0.0.1"));
            limiter.record_failure("127.0.0.1");
        }
        assert!(limiter.is_locked("127.0.0.1"));
        // Another source is unaffected.
        assert!(!limiter.is_locked("10.0.0.9"));

        limiter.clear("127.0.0.1");
        assert!(!limiter.is_locked("127.0.0.1"));
    }
}
