//! Two-Tier Token Authority (§4.4)
//!
//! Access tokens authenticate a session; query tokens authorize a single
//! query within a session. Both are 256-bit random hex strings stored in an
//! [`ExpiringStore`](crate::kvs::ExpiringStore) with TTLs of 3600s and 600s
//! respectively.
//!
//! ## Query-token payload binding (§12.3, resolving the §9 weakness)
//!
//! `mint_query` stores `access_token||blake3(payload)` as the value rather
//! than the bare access token, grounded on the teacher's `new_session`
//! helper in `tinyzkp_api.rs`, which hashes session payloads with `blake3`
//! before storing them. [`TokenAuthority::validate_query`] keeps the exact
//! two-argument contract required by Testable Property 8 (it only compares
//! the access-token half); [`TokenAuthority::validate_query_bound`] is the
//! stronger check query-execution handlers use, which additionally requires
//! the caller's current payload to hash to the value stored at mint time.
//!
//! ## Revocation is keyed by user, not by token
//!
//! [`TokenAuthority::revoke_access`] takes a `user_id` and invalidates every
//! access token minted for that user, mirroring `token_manager.py`'s
//! `revoke_tokens_for_user`. Since [`ExpiringStore`] has no scan-by-value
//! primitive, `mint_access` also writes the new token into a per-user
//! JSON-array index key that `revoke_access` reads back to find every token
//! to delete.

use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CoreError;
use crate::kvs::ExpiringStore;

/// Access token TTL (§3): 3600 seconds.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(3600);
/// Query token TTL (§3): 600 seconds.
pub const QUERY_TOKEN_TTL: Duration = Duration::from_secs(600);

const ACCESS_PREFIX: &str = "securequery:access:";
const QUERY_PREFIX: &str = "securequery:query:";
const USER_INDEX_PREFIX: &str = "securequery:user:";

/// The two-tier token authority (§4.4).
pub struct TokenAuthority {
    store: Arc<dyn ExpiringStore>,
}

impl TokenAuthority {
    pub fn new(store: Arc<dyn ExpiringStore>) -> Self {
        Self { store }
    }

    /// Generate 32 random bytes, hex-encode them as the token (§3: 256-bit
    /// random hex string).
    fn random_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Mint an access token for `user_id`, TTL 3600s.
    pub async fn mint_access(&self, user_id: &str) -> Result<String, CoreError> {
        if user_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("user_id is required".into()));
        }
        let token = Self::random_token();
        self.store
            .set_ex(&format!("{ACCESS_PREFIX}{token}"), user_id, ACCESS_TOKEN_TTL)
            .await?;
        self.index_user_token(user_id, &token).await?;
        Ok(token)
    }

    /// Record `token` under `user_id`'s index so [`revoke_access`](Self::revoke_access)
    /// can find every token belonging to that user without a store-wide scan
    /// primitive (`ExpiringStore` has none). Read-modify-write against a
    /// single JSON-array key; re-minting refreshes the index's own TTL so it
    /// always outlives the longest-lived token it lists.
    async fn index_user_token(&self, user_id: &str, token: &str) -> Result<(), CoreError> {
        let key = format!("{USER_INDEX_PREFIX}{user_id}");
        let mut tokens: Vec<String> = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
        let encoded = serde_json::to_string(&tokens)
            .map_err(|e| CoreError::Fatal(format!("encode user token index: {e}")))?;
        self.store.set_ex(&key, &encoded, ACCESS_TOKEN_TTL).await
    }

    /// True iff `token` is present (unexpired, unrevoked) in the store.
    pub async fn validate_access(&self, token: &str) -> Result<bool, CoreError> {
        Ok(self.store.get(&format!("{ACCESS_PREFIX}{token}")).await?.is_some())
    }

    /// Mint a query token bound to `access_token`, requiring it to already
    /// be valid. The query payload is hashed into the stored value (§12.3)
    /// but is not otherwise interpreted here.
    pub async fn mint_query(
        &self,
        access_token: &str,
        query_payload: &str,
    ) -> Result<String, CoreError> {
        if !self.validate_access(access_token).await? {
            return Err(CoreError::Unauthorized("invalid or expired access token".into()));
        }
        let token = Self::random_token();
        let payload_hash = blake3::hash(query_payload.as_bytes()).to_hex().to_string();
        let value = format!("{access_token}|{payload_hash}");
        self.store
            .set_ex(&format!("{QUERY_PREFIX}{token}"), &value, QUERY_TOKEN_TTL)
            .await?;
        Ok(token)
    }

    /// True iff the store maps `query_token` to exactly `access_token`
    /// (Testable Property 8's two-argument contract — payload binding is
    /// not part of this check).
    pub async fn validate_query(&self, access_token: &str, query_token: &str) -> Result<bool, CoreError> {
        let stored = self.store.get(&format!("{QUERY_PREFIX}{query_token}")).await?;
        Ok(match stored {
            Some(value) => value.split('|').next() == Some(access_token),
            None => false,
        })
    }

    /// Stronger validation used by query-execution handlers: in addition to
    /// [`validate_query`](Self::validate_query)'s check, requires the live
    /// query payload to hash to the value recorded at mint time.
    pub async fn validate_query_bound(
        &self,
        access_token: &str,
        query_token: &str,
        query_payload: &str,
    ) -> Result<bool, CoreError> {
        let stored = self.store.get(&format!("{QUERY_PREFIX}{query_token}")).await?;
        let Some(value) = stored else {
            return Ok(false);
        };
        let mut parts = value.splitn(2, '|');
        let stored_access = parts.next().unwrap_or("");
        let stored_hash = parts.next().unwrap_or("");
        if stored_access != access_token {
            return Ok(false);
        }
        let live_hash = blake3::hash(query_payload.as_bytes()).to_hex().to_string();
        Ok(stored_hash == live_hash)
    }

    /// Revoke every access token minted for `user_id` (§4.4), grounded on
    /// `original_source/backend/shared/token_manager.py`'s
    /// `revoke_tokens_for_user`. Looks up the user's token index rather than
    /// taking a token value directly, then deletes each listed token plus
    /// the index itself.
    pub async fn revoke_access(&self, user_id: &str) -> Result<(), CoreError> {
        let key = format!("{USER_INDEX_PREFIX}{user_id}");
        let tokens: Vec<String> = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        for token in &tokens {
            self.store.delete(&format!("{ACCESS_PREFIX}{token}")).await?;
        }
        self.store.delete(&key).await?;
        Ok(())
    }

    /// Revoke a specific query token.
    pub async fn revoke_query(&self, query_token: &str) -> Result<(), CoreError> {
        self.store.delete(&format!("{QUERY_PREFIX}{query_token}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvs::InMemoryStore;

    fn authority() -> TokenAuthority {
        TokenAuthority::new(Arc::new(InMemoryStore::new()))
    }

    /// Scenario S1 (token half): mint + validate round-trips.
    #[tokio::test]
    async fn access_token_validates_after_mint() {
        let auth = authority();
        let token = auth.mint_access("alice").await.unwrap();
        assert!(auth.validate_access(&token).await.unwrap());
        assert!(!auth.validate_access("not-a-real-token").await.unwrap());
    }

    #[tokio::test]
    async fn query_token_requires_valid_access_token() {
        let auth = authority();
        let err = auth.mint_query("bogus", "{}").await.unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    /// Testable Property 8: token binding.
    #[tokio::test]
    async fn query_token_binds_to_its_access_token() {
        let auth = authority();
        let access = auth.mint_access("alice").await.unwrap();
        let other_access = auth.mint_access("mallory").await.unwrap();
        let query = auth.mint_query(&access, "{\"field\":\"name\"}").await.unwrap();

        assert!(auth.validate_query(&access, &query).await.unwrap());
        assert!(!auth.validate_query(&other_access, &query).await.unwrap());
    }

    /// §12.3: payload binding rejects a token minted for a different query.
    #[tokio::test]
    async fn bound_validation_rejects_mismatched_payload() {
        let auth = authority();
        let access = auth.mint_access("alice").await.unwrap();
        let query = auth.mint_query(&access, "{\"field\":\"name\",\"value\":\"a\"}").await.unwrap();

        assert!(auth
            .validate_query_bound(&access, &query, "{\"field\":\"name\",\"value\":\"a\"}")
            .await
            .unwrap());
        assert!(!auth
            .validate_query_bound(&access, &query, "{\"field\":\"name\",\"value\":\"b\"}")
            .await
            .unwrap());
        // The unbound, two-argument contract is unaffected by payload mismatch.
        assert!(auth.validate_query(&access, &query).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_access_invalidates_every_token_for_user() {
        let auth = authority();
        let token_a = auth.mint_access("alice").await.unwrap();
        let token_b = auth.mint_access("alice").await.unwrap();
        let mallory_token = auth.mint_access("mallory").await.unwrap();

        auth.revoke_access("alice").await.unwrap();

        assert!(!auth.validate_access(&token_a).await.unwrap());
        assert!(!auth.validate_access(&token_b).await.unwrap());
        assert!(auth.validate_access(&mallory_token).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_query_invalidates_query_token() {
        let auth = authority();
        let access = auth.mint_access("alice").await.unwrap();
        let query = auth.mint_query(&access, "{}").await.unwrap();
        auth.revoke_query(&query).await.unwrap();
        assert!(!auth.validate_query(&access, &query).await.unwrap());
    }

    /// Testable Property 9 / Scenario S6: expiry.
    #[tokio::test]
    async fn query_token_expires_after_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let auth = TokenAuthority::new(store.clone());
        let access = auth.mint_access("alice").await.unwrap();

        // Mint a query token directly with a tiny TTL to avoid a real 600s sleep.
        let token = "deadbeef".to_string();
        let value = format!("{access}|{}", blake3::hash(b"{}").to_hex());
        store
            .set_ex(&format!("{QUERY_PREFIX}{token}"), &value, Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!auth.validate_query(&access, &token).await.unwrap());
    }
}
