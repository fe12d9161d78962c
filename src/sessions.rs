// =============================================================================
// Session Manager — bearer tokens, expiry, per-token rate limits
// =============================================================================
//
// Issues opaque bearer tokens on authenticated login (password or HMAC-signed
// SSO assertion), maps token -> account with idle expiry, and enforces a
// token-bucket rate limit per token. Shared by the REST surface (token per
// request) and the distributor (token on the WS handshake).
//
// Password comparison is constant time to avoid timing side-channels.
// =============================================================================

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AccountConfig, SessionConfig};
use crate::errors::{CoreError, CoreResult};

/// Compare two byte slices in constant time. The comparison always examines
/// every byte even when a mismatch is found early.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// Classic token bucket: capacity == refill rate, so a client may burst one
/// second's allowance.
struct TokenBucket {
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64) -> Self {
        Self {
            tokens: rate_per_sec,
            rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

struct Session {
    account_id: String,
    /// Epoch ms after which the token is dead regardless of activity.
    expires_at_ms: i64,
    bucket: TokenBucket,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub account_id: String,
    pub expires_at_ms: i64,
}

pub struct SessionManager {
    cfg: SessionConfig,
    /// Account id -> password, from provisioning config.
    credentials: HashMap<String, String>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(cfg: SessionConfig, accounts: &[AccountConfig]) -> Self {
        let credentials = accounts
            .iter()
            .map(|a| (a.id.clone(), a.password.clone()))
            .collect();
        Self {
            cfg,
            credentials,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Password login. Issues a fresh token on success.
    pub fn login(&self, account_id: &str, password: &str) -> CoreResult<IssuedToken> {
        let expected = self
            .credentials
            .get(account_id)
            .ok_or(CoreError::Forbidden)?;
        if !constant_time_eq(password.as_bytes(), expected.as_bytes()) {
            warn!(account = account_id, "login rejected: bad password");
            return Err(CoreError::Forbidden);
        }
        Ok(self.issue(account_id))
    }

    /// SSO login: `assertion` is `"<account_id>:<hex hmac-sha256>"` signed
    /// with the secret in `HELIOS_SSO_SECRET`.
    pub fn login_sso(&self, assertion: &str) -> CoreResult<IssuedToken> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let secret = std::env::var("HELIOS_SSO_SECRET")
            .map_err(|_| CoreError::MissingCredential("HELIOS_SSO_SECRET".into()))?;
        let (account_id, signature) = assertion
            .rsplit_once(':')
            .ok_or(CoreError::Forbidden)?;
        if !self.credentials.contains_key(account_id) {
            return Err(CoreError::Forbidden);
        }

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| CoreError::Internal("hmac key".into()))?;
        mac.update(account_id.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            warn!(account = account_id, "sso assertion rejected");
            return Err(CoreError::Forbidden);
        }
        Ok(self.issue(account_id))
    }

    fn issue(&self, account_id: &str) -> IssuedToken {
        let token = Uuid::new_v4().to_string();
        let expires_at_ms = Utc::now().timestamp_millis() + self.cfg.token_ttl_secs * 1_000;
        self.sessions.lock().insert(
            token.clone(),
            Session {
                account_id: account_id.to_string(),
                expires_at_ms,
                bucket: TokenBucket::new(self.cfg.rate_limit_per_sec),
            },
        );
        info!(account = account_id, "token issued");
        IssuedToken {
            token,
            account_id: account_id.to_string(),
            expires_at_ms,
        }
    }

    /// Resolve a token to its account, refreshing the idle expiry.
    pub fn validate(&self, token: &str) -> CoreResult<String> {
        if token.is_empty() {
            return Err(CoreError::AuthRequired);
        }
        let now_ms = Utc::now().timestamp_millis();
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(token) else {
            return Err(CoreError::AuthRequired);
        };
        if now_ms >= session.expires_at_ms {
            sessions.remove(token);
            debug!("expired token presented");
            return Err(CoreError::TokenExpired);
        }
        // Sliding idle expiry.
        session.expires_at_ms = now_ms + self.cfg.token_ttl_secs * 1_000;
        Ok(session.account_id.clone())
    }

    /// Validate + spend one rate-limit token.
    pub fn authorize(&self, token: &str) -> CoreResult<String> {
        let now_ms = Utc::now().timestamp_millis();
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(token) else {
            return Err(CoreError::AuthRequired);
        };
        if now_ms >= session.expires_at_ms {
            sessions.remove(token);
            return Err(CoreError::TokenExpired);
        }
        if !session.bucket.try_take() {
            return Err(CoreError::RateLimited);
        }
        session.expires_at_ms = now_ms + self.cfg.token_ttl_secs * 1_000;
        Ok(session.account_id.clone())
    }

    pub fn logout(&self, token: &str) {
        if self.sessions.lock().remove(token).is_some() {
            info!("token invalidated on logout");
        }
    }

    /// Drop expired sessions; run periodically by the supervisor.
    pub fn sweep(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at_ms > now_ms);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "expired sessions swept");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarginMode;

    fn manager() -> SessionManager {
        manager_with_rate(1_000.0)
    }

    fn manager_with_rate(rate: f64) -> SessionManager {
        let accounts = vec![AccountConfig {
            id: "acc-1".into(),
            password: "hunter2".into(),
            balance: 10_000.0,
            leverage: 100.0,
            margin_mode: MarginMode::Hedging,
            currency: None,
            demo: true,
        }];
        SessionManager::new(
            SessionConfig {
                token_ttl_secs: 900,
                rate_limit_per_sec: rate,
            },
            &accounts,
        )
    }

    #[test]
    fn login_and_validate() {
        let mgr = manager();
        let issued = mgr.login("acc-1", "hunter2").unwrap();
        assert_eq!(issued.account_id, "acc-1");
        assert_eq!(mgr.validate(&issued.token).unwrap(), "acc-1");
    }

    #[test]
    fn bad_credentials_rejected() {
        let mgr = manager();
        assert!(matches!(
            mgr.login("acc-1", "wrong"),
            Err(CoreError::Forbidden)
        ));
        assert!(matches!(
            mgr.login("ghost", "hunter2"),
            Err(CoreError::Forbidden)
        ));
    }

    #[test]
    fn unknown_token_rejected() {
        let mgr = manager();
        assert!(matches!(
            mgr.validate("not-a-token"),
            Err(CoreError::AuthRequired)
        ));
        assert!(matches!(mgr.validate(""), Err(CoreError::AuthRequired)));
    }

    #[test]
    fn logout_invalidates() {
        let mgr = manager();
        let issued = mgr.login("acc-1", "hunter2").unwrap();
        mgr.logout(&issued.token);
        assert!(matches!(
            mgr.validate(&issued.token),
            Err(CoreError::AuthRequired)
        ));
    }

    #[test]
    fn rate_limit_trips_and_refills() {
        let mgr = manager_with_rate(3.0);
        let issued = mgr.login("acc-1", "hunter2").unwrap();
        for _ in 0..3 {
            assert!(mgr.authorize(&issued.token).is_ok());
        }
        assert!(matches!(
            mgr.authorize(&issued.token),
            Err(CoreError::RateLimited)
        ));
        // A second's worth of refill restores the budget.
        std::thread::sleep(std::time::Duration::from_millis(400));
        assert!(mgr.authorize(&issued.token).is_ok());
    }

    #[test]
    fn expired_sessions_swept() {
        let accounts = vec![AccountConfig {
            id: "acc-1".into(),
            password: "pw".into(),
            balance: 0.0,
            leverage: 100.0,
            margin_mode: MarginMode::Hedging,
            currency: None,
            demo: true,
        }];
        let mgr = SessionManager::new(
            SessionConfig {
                token_ttl_secs: 0,
                rate_limit_per_sec: 10.0,
            },
            &accounts,
        );
        let issued = mgr.login("acc-1", "pw").unwrap();
        assert!(matches!(
            mgr.validate(&issued.token),
            Err(CoreError::TokenExpired)
        ));
        mgr.login("acc-1", "pw").unwrap();
        assert_eq!(mgr.sweep(), 1);
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn sso_assertion_round_trip() {
        std::env::set_var("HELIOS_SSO_SECRET", "sso-secret");
        let mgr = manager();

        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"sso-secret").unwrap();
        mac.update(b"acc-1");
        let sig = hex::encode(mac.finalize().into_bytes());

        let issued = mgr.login_sso(&format!("acc-1:{sig}")).unwrap();
        assert_eq!(issued.account_id, "acc-1");

        assert!(mgr.login_sso("acc-1:deadbeef").is_err());
        assert!(mgr.login_sso("no-colon").is_err());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
