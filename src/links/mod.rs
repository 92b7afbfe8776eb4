//! Single-use download links
//!
//! Issues HMAC-bound tokens granting one anonymous download of one file,
//! consumes them exactly once, and reaps stale records in the background.
//! Token entropy is 256 bits of OS randomness, URL-safe base64 encoded; the
//! signature binds (token, path, expiry) under the configured secret.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::watch;

use crate::core::{FsError, FsResult, LinkStatus, SingleUseLink};
use crate::metadata::SharedMetadataStore;

type HmacSha256 = Hmac<Sha256>;

/// Expiry bounds accepted by the generate endpoint (seconds).
pub const MIN_EXPIRY_SECS: i64 = 1;
pub const MAX_EXPIRY_SECS: i64 = 86_400;

/// How often the reaper sweeps.
const REAPER_INTERVAL: Duration = Duration::from_secs(300);
/// Used links older than this are removed (hours).
const USED_RETENTION_HOURS: i64 = 24;

/// Issues, validates and consumes single-use links.
pub struct LinkManager {
    store: SharedMetadataStore,
    secret: Vec<u8>,
}

impl LinkManager {
    pub fn new(store: SharedMetadataStore, secret: &str) -> Self {
        Self {
            store,
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn sign(&self, token: &str, path: &str, expires_at: DateTime<Utc>) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(token.as_bytes());
        mac.update(b"\n");
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires_at.to_rfc3339().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify(&self, link: &SingleUseLink) -> bool {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(link.token.as_bytes());
        mac.update(b"\n");
        mac.update(link.path.as_bytes());
        mac.update(b"\n");
        mac.update(link.expires_at.to_rfc3339().as_bytes());

        let Ok(expected) = hex::decode(&link.signature) else {
            return false;
        };
        mac.verify_slice(&expected).is_ok()
    }

    fn random_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Mint an active link for `path` valid for `expiry_seconds`.
    pub async fn generate(&self, path: &str, expiry_seconds: i64) -> FsResult<SingleUseLink> {
        if !(MIN_EXPIRY_SECS..=MAX_EXPIRY_SECS).contains(&expiry_seconds) {
            return Err(FsError::InvalidInput(format!(
                "expiry_seconds must be between {MIN_EXPIRY_SECS} and {MAX_EXPIRY_SECS}"
            )));
        }

        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(expiry_seconds);
        let token = Self::random_token();
        let link = SingleUseLink {
            signature: self.sign(&token, path, expires_at),
            token,
            path: path.to_string(),
            status: LinkStatus::Active,
            expires_at,
            used_at: None,
            used_by_ip: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_link(&link).await?;
        Ok(link)
    }

    /// Resolve a token and consume it. At most one caller ever gets the
    /// file path back; everyone else sees gone.
    pub async fn validate_and_consume(
        &self,
        token: &str,
        consumer_ip: &str,
    ) -> FsResult<String> {
        let link = self.store.get_link(token).await?;

        let now = Utc::now();
        if link.status != LinkStatus::Active {
            return Err(FsError::Gone(format!(
                "link is {}",
                link.status.as_str()
            )));
        }
        if link.is_expired(now) {
            // Mark it on read; the reaper would get it eventually anyway.
            let _ = self
                .store
                .update_link(token, LinkStatus::Expired, None, None)
                .await;
            return Err(FsError::Gone("link expired".to_string()));
        }
        if !self.verify(&link) {
            return Err(FsError::Gone("link signature mismatch".to_string()));
        }

        // Conditional transition: the store only honors active → used.
        self.store
            .update_link(
                token,
                LinkStatus::Used,
                Some(now),
                Some(consumer_ip.to_string()),
            )
            .await?;
        Ok(link.path)
    }

    /// Run one reap round; returns (expired, used) removal counts.
    pub async fn reap(&self) -> FsResult<(u64, u64)> {
        let now = Utc::now();
        let expired = self.store.cleanup_expired_links(now).await?;
        let used = self
            .store
            .cleanup_used_links(now - ChronoDuration::hours(USED_RETENTION_HOURS))
            .await?;
        Ok((expired, used))
    }

    /// Spawn the periodic reaper; stops when `shutdown` flips to true.
    pub fn spawn_reaper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.reap().await {
                            Ok((expired, used)) if expired + used > 0 => {
                                tracing::info!(expired, used, "link reaper removed records");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "link reaper round failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadataStore;

    fn manager() -> (Arc<LinkManager>, SharedMetadataStore) {
        let store: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());
        (
            Arc::new(LinkManager::new(Arc::clone(&store), "link-secret")),
            store,
        )
    }

    #[tokio::test]
    async fn test_generate_and_consume_once() {
        let (manager, _store) = manager();
        let link = manager.generate("/r.txt", 60).await.unwrap();
        assert_eq!(link.status, LinkStatus::Active);
        // 32 bytes of entropy, base64url without padding.
        assert_eq!(link.token.len(), 43);

        let path = manager
            .validate_and_consume(&link.token, "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(path, "/r.txt");

        // Second consumer gets gone.
        let err = manager
            .validate_and_consume(&link.token, "10.0.0.2")
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Gone(_)));
    }

    #[tokio::test]
    async fn test_unknown_token_not_found() {
        let (manager, _store) = manager();
        let err = manager
            .validate_and_consume("nope", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_expiry_bounds() {
        let (manager, _store) = manager();
        assert!(manager.generate("/f", 0).await.is_err());
        assert!(manager.generate("/f", 86_401).await.is_err());
        assert!(manager.generate("/f", 1).await.is_ok());
        assert!(manager.generate("/f", 86_400).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_link_is_gone_and_marked() {
        let (manager, store) = manager();
        let link = manager.generate("/f", 60).await.unwrap();

        // Backdate the expiry.
        let mut stale = store.get_link(&link.token).await.unwrap();
        stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
        // Re-sign so only the expiry check fires.
        stale.signature = manager.sign(&stale.token, &stale.path, stale.expires_at);
        let memory = store.clone();
        memory.delete_link(&link.token).await.unwrap();
        memory.create_link(&stale).await.unwrap();

        let err = manager
            .validate_and_consume(&link.token, "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Gone(_)));
        assert_eq!(
            store.get_link(&link.token).await.unwrap().status,
            LinkStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let (manager, store) = manager();
        let link = manager.generate("/real.txt", 60).await.unwrap();

        // Re-point the link at another path without re-signing.
        let mut forged = store.get_link(&link.token).await.unwrap();
        forged.path = "/etc/shadow".to_string();
        store.delete_link(&link.token).await.unwrap();
        store.create_link(&forged).await.unwrap();

        let err = manager
            .validate_and_consume(&link.token, "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Gone(_)));
    }

    #[tokio::test]
    async fn test_concurrent_consumers_exactly_one_wins() {
        let (manager, _store) = manager();
        let link = manager.generate("/hot.txt", 60).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            let token = link.token.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .validate_and_consume(&token, &format!("10.0.0.{i}"))
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_reap_counts() {
        let (manager, store) = manager();
        let link = manager.generate("/f", 60).await.unwrap();
        manager
            .validate_and_consume(&link.token, "10.0.0.1")
            .await
            .unwrap();

        // Backdate the consumption far past the retention window.
        let mut used = store.get_link(&link.token).await.unwrap();
        used.used_at = Some(Utc::now() - ChronoDuration::hours(48));
        store.delete_link(&link.token).await.unwrap();
        store.create_link(&used).await.unwrap();

        let (expired, reaped_used) = manager.reap().await.unwrap();
        assert_eq!(expired, 0);
        assert_eq!(reaped_used, 1);
        assert!(store.get_link(&link.token).await.unwrap_err().is_not_found());
    }
}
