//! Day-scoped signing keys and the cache that hands them out.

use std::{fmt, sync::Arc};

use chrono::{DateTime, NaiveDate, Utc};
use grafana_plugin_sdk::backend::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{auth, config::Secret, Error, Result};

/// A signing key, valid only on the UTC day it was issued.
///
/// Keys are never modified; an expired key is replaced wholesale.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    material: [u8; 32],
    issued: DateTime<Utc>,
}

impl SigningKey {
    /// Wrap key material issued at `issued`.
    pub fn new(material: [u8; 32], issued: DateTime<Utc>) -> Self {
        Self { material, issued }
    }

    /// The raw key material.
    pub fn material(&self) -> &[u8; 32] {
        &self.material
    }

    /// When the key was issued.
    pub fn issued(&self) -> DateTime<Utc> {
        self.issued
    }

    /// The UTC calendar day the key is valid on.
    pub fn issued_date(&self) -> NaiveDate {
        self.issued.date_naive()
    }

    /// Whether the key may be used to sign a request made at `now`.
    ///
    /// Validity is decided by UTC calendar day, not by elapsed time: a key
    /// issued at 23:59 expires one minute later.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.issued_date() == now.date_naive()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("material", &"<redacted>")
            .field("issued", &self.issued)
            .finish()
    }
}

/// The bootstrap form of a signing key, as served by the `sk` resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SigningKeyInfo {
    /// Hex encoded key material.
    pub key: String,
    /// When the key was issued.
    pub date: DateTime<Utc>,
}

impl From<&SigningKey> for SigningKeyInfo {
    fn from(key: &SigningKey) -> Self {
        Self {
            key: hex::encode(key.material),
            date: key.issued,
        }
    }
}

/// Something that can issue a fresh signing key.
#[async_trait]
pub trait KeyIssuer: Send + Sync {
    /// Issue a key valid on the UTC day of `now`.
    async fn issue(&self, now: DateTime<Utc>) -> Result<SigningKey>;
}

/// Issues keys by deriving them from the token secret.
#[derive(Clone, Debug)]
pub struct SecretKeyIssuer {
    secret: Secret,
}

impl SecretKeyIssuer {
    /// Create an issuer for `secret`.
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }
}

#[async_trait]
impl KeyIssuer for SecretKeyIssuer {
    async fn issue(&self, now: DateTime<Utc>) -> Result<SigningKey> {
        let material = auth::derive_signing_key(self.secret.expose(), now.date_naive());
        Ok(SigningKey::new(material, now))
    }
}

/// Lazily fetches a signing key and keeps it until the UTC day changes.
///
/// The cached key sits behind an async mutex which is held for the whole of a
/// refresh, so concurrent callers queue behind a single in-flight fetch and
/// all observe its result.
pub struct SigningKeyCache<I> {
    issuer: I,
    current: Mutex<Option<Arc<SigningKey>>>,
}

impl<I> SigningKeyCache<I>
where
    I: KeyIssuer,
{
    /// Create an empty cache; the first call to [`SigningKeyCache::key`] fetches.
    pub fn new(issuer: I) -> Self {
        Self {
            issuer,
            current: Mutex::new(None),
        }
    }

    /// The issuer fresh keys are fetched from.
    pub fn issuer(&self) -> &I {
        &self.issuer
    }

    /// Get a key valid at `now`, fetching a new one if the cached key was
    /// issued on a different UTC day.
    ///
    /// A fetch failure leaves the cache empty and is returned to the caller.
    /// If the issuer hands back a key that is itself not valid at `now`,
    /// [`Error::StaleSigningKey`] is returned rather than fetching again.
    pub async fn key(&self, now: DateTime<Utc>) -> Result<Arc<SigningKey>> {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(key) if key.is_valid_at(now) => return Ok(Arc::clone(key)),
            Some(key) => {
                info!(issued = %key.issued_date(), today = %now.date_naive(), "Signing key expired");
                *current = None;
            }
            None => debug!("Fetching initial signing key"),
        }
        let key = self.issuer.issue(now).await?;
        if !key.is_valid_at(now) {
            return Err(Error::StaleSigningKey {
                issued: key.issued_date(),
                today: now.date_naive(),
            });
        }
        let key = Arc::new(key);
        *current = Some(Arc::clone(&key));
        Ok(key)
    }
}

impl<I> fmt::Debug for SigningKeyCache<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;

    /// Issues keys stamped with the requested time, counting every fetch.
    #[derive(Debug, Default)]
    pub(crate) struct CountingIssuer {
        pub(crate) fetches: AtomicUsize,
        pub(crate) issued_offset: Option<Duration>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl KeyIssuer for CountingIssuer {
        async fn issue(&self, now: DateTime<Utc>) -> Result<SigningKey> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            // Give concurrent callers a chance to pile up behind the lock.
            tokio::task::yield_now().await;
            if self.fail {
                return Err(Error::KeyIssuance("issuer unavailable".to_string()));
            }
            let issued = now + self.issued_offset.unwrap_or_else(Duration::zero);
            Ok(SigningKey::new([n as u8; 32], issued))
        }
    }

    impl CountingIssuer {
        pub(crate) fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn same_day_reuses_cached_key() {
        let cache = SigningKeyCache::new(CountingIssuer::default());
        let first = cache.key(at(1, 0, 5)).await.unwrap();
        let second = cache.key(at(1, 23, 59)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.issuer.fetches(), 1);
    }

    #[tokio::test]
    async fn crossing_midnight_refetches_once() {
        let cache = SigningKeyCache::new(CountingIssuer::default());
        let before = cache.key(at(1, 23, 59)).await.unwrap();
        let after = cache.key(at(2, 0, 1)).await.unwrap();
        assert_eq!(cache.issuer.fetches(), 2);
        assert_ne!(before.material(), after.material());
        assert_eq!(after.issued_date(), at(2, 0, 1).date_naive());
        let again = cache.key(at(2, 12, 0)).await.unwrap();
        assert!(Arc::ptr_eq(&after, &again));
        assert_eq!(cache.issuer.fetches(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let cache = SigningKeyCache::new(CountingIssuer::default());
        let now = at(5, 12, 0);
        let keys = futures_util::future::join_all((0..8).map(|_| cache.key(now))).await;
        assert_eq!(cache.issuer.fetches(), 1);
        let first = keys[0].as_ref().unwrap();
        assert!(keys
            .iter()
            .all(|k| Arc::ptr_eq(first, k.as_ref().unwrap())));
    }

    #[tokio::test]
    async fn issuer_failure_propagates_and_is_retried_next_call() {
        let cache = SigningKeyCache::new(CountingIssuer {
            fail: true,
            ..Default::default()
        });
        let err = cache.key(at(1, 0, 0)).await.unwrap_err();
        assert!(matches!(err, Error::KeyIssuance(_)));
        assert!(cache.key(at(1, 0, 0)).await.is_err());
        assert_eq!(cache.issuer.fetches(), 2);
    }

    #[tokio::test]
    async fn stale_issued_key_is_an_error_not_a_loop() {
        let cache = SigningKeyCache::new(CountingIssuer {
            issued_offset: Some(Duration::days(-1)),
            ..Default::default()
        });
        let err = cache.key(at(3, 8, 0)).await.unwrap_err();
        assert!(matches!(err, Error::StaleSigningKey { .. }), "{err}");
        assert_eq!(cache.issuer.fetches(), 1);
    }

    #[tokio::test]
    async fn secret_issuer_derives_from_secret() {
        let issuer = SecretKeyIssuer::new(Secret::new("s3cret"));
        let now = at(4, 10, 0);
        let key = issuer.issue(now).await.unwrap();
        assert_eq!(
            key.material(),
            &auth::derive_signing_key("s3cret", now.date_naive())
        );
        let info = SigningKeyInfo::from(&key);
        assert_eq!(info.key.len(), 64);
        assert_eq!(info.date, now);
    }
}
