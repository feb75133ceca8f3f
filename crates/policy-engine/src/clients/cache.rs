//! In-memory implementation of [`ImageVerifyCache`].
//!
//! Entries are time bound: cached verdicts are purged lazily after the TTL
//! elapses. Only successful verifications are ever stored, so a `get` hit
//! always means "verified".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::errors::CacheError;
use super::ImageVerifyCache;

const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Hash, PartialEq, Eq, Clone, Debug)]
struct CacheKey {
    policy: String,
    rule: String,
    image: String,
}

pub struct InMemoryImageVerifyCache {
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, Instant>>,
}

impl Default for InMemoryImageVerifyCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl InMemoryImageVerifyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ImageVerifyCache for InMemoryImageVerifyCache {
    async fn get(&self, policy: &str, rule: &str, image: &str) -> Result<bool, CacheError> {
        let key = CacheKey {
            policy: policy.to_string(),
            rule: rule.to_string(),
            image: image.to_string(),
        };

        // take a reader lock first; expired entries are removed under the
        // writer lock only when actually observed
        let expired = {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                None => return Ok(false),
                Some(stored) => stored.elapsed() > self.ttl,
            }
        };

        if expired {
            let mut entries = self.entries.write().await;
            if let Some(stored) = entries.get(&key) {
                if stored.elapsed() > self.ttl {
                    entries.remove(&key);
                }
            }
            debug!(policy, rule, image, "cached verification expired");
            return Ok(false);
        }

        Ok(true)
    }

    async fn set(&self, policy: &str, rule: &str, image: &str) -> Result<(), CacheError> {
        let key = CacheKey {
            policy: policy.to_string(),
            rule: rule.to_string(),
            image: image.to_string(),
        };
        self.entries.write().await.insert(key, Instant::now());
        Ok(())
    }

    async fn delete(&self, policy: &str, rule: &str, image: &str) -> Result<(), CacheError> {
        let key = CacheKey {
            policy: policy.to_string(),
            rule: rule.to_string(),
            image: image.to_string(),
        };
        self.entries.write().await.remove(&key);
        Ok(())
    }

    async fn delete_for_rule(&self, policy: &str, rule: &str) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .retain(|k, _| !(k.policy == policy && k.rule == rule));
        Ok(())
    }

    async fn delete_for_policy(&self, policy: &str) -> Result<(), CacheError> {
        self.entries.write().await.retain(|k, _| k.policy != policy);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }
}
