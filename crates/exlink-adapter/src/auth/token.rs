/*
[INPUT]:  Token grants from the exchange and the persisted token file
[OUTPUT]: AuthToken values with expiry checks
[POS]:    Auth layer - WebSocket session token data
[UPDATE]: When token persistence format or usability rules change
*/

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::{read_json_sync, write_json_atomic};
use crate::http::Result;

/// Short-lived credential for the private WebSocket session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh_count: u64,
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("refresh_count", &self.refresh_count)
            .finish()
    }
}

impl AuthToken {
    pub fn new(
        token: impl Into<String>,
        issued_at: DateTime<Utc>,
        lifetime: Duration,
        refresh_count: u64,
    ) -> Self {
        let lifetime = chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::zero());
        Self {
            token: token.into(),
            issued_at,
            expires_at: issued_at + lifetime,
            refresh_count,
        }
    }

    /// Usable while `now < expires_at - margin`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        now < self.expires_at - margin
    }

    pub fn is_usable(&self, margin: Duration) -> bool {
        self.is_usable_at(Utc::now(), margin)
    }

    /// Remaining lifetime, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Token returned by the exchange before bookkeeping is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub lifetime: Duration,
}

/// Anything that can mint a fresh session token (REST endpoint, test double).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<TokenGrant>;
}

/// File holding the last issued token.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted token. A corrupt file is logged and ignored.
    pub fn load(&self) -> Option<AuthToken> {
        match read_json_sync::<AuthToken>(&self.path) {
            Ok(token) => token,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable token file");
                None
            }
        }
    }

    pub async fn save(&self, token: &AuthToken) -> Result<()> {
        write_json_atomic(&self.path, token).await?;
        debug!(path = %self.path.display(), refresh_count = token.refresh_count, "token persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    #[test]
    fn usability_respects_safety_margin() {
        let issued = Utc::now();
        let token = AuthToken::new("t", issued, Duration::from_secs(900), 0);

        assert!(token.is_usable_at(issued, Duration::from_secs(120)));
        assert!(token.is_usable_at(
            issued + chrono::Duration::seconds(779),
            Duration::from_secs(120)
        ));
        assert!(!token.is_usable_at(
            issued + chrono::Duration::seconds(780),
            Duration::from_secs(120)
        ));
        assert_eq!(
            token.remaining_at(issued + chrono::Duration::seconds(1_000)),
            Duration::ZERO
        );
    }

    #[test]
    fn serializes_camel_case_and_redacts_debug() {
        let token = AuthToken::new("secret", Utc::now(), Duration::from_secs(60), 3);
        let json = serde_json::to_value(&token).unwrap();

        assert!(json.get("issuedAt").is_some());
        assert!(json.get("expiresAt").is_some());
        assert_eq!(json["refreshCount"], 3);
        assert!(!format!("{token:?}").contains("secret"));
    }

    #[tokio::test]
    async fn store_round_trips_and_tolerates_missing_file() {
        let dir = std::env::temp_dir().join(format!("exlink-token-{}", Uuid::new_v4()));
        let store = TokenStore::new(dir.join("token.json"));
        assert!(store.load().is_none());

        let token = AuthToken::new("abc", Utc::now(), Duration::from_secs(900), 1);
        store.save(&token).await.unwrap();
        assert_eq!(store.load(), Some(token));

        std::fs::write(store.path(), b"not json").unwrap();
        assert!(store.load().is_none());

        std::fs::remove_dir_all(dir).unwrap();
    }
}
