//! Server-side session cache and its admission policy.

use std::sync::Arc;

use rustls::server::{ServerSessionMemoryCache, StoresServerSessions};
use tracing::trace;

/// Whether an established session may be stored for resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Always,
    Never,
}

/// In-memory session store gated by a [`CachePolicy`].
#[derive(Debug)]
pub struct SessionCache {
    inner: Arc<ServerSessionMemoryCache>,
    policy: CachePolicy,
}

impl SessionCache {
    pub fn new(capacity: usize, policy: CachePolicy) -> Self {
        Self {
            inner: ServerSessionMemoryCache::new(capacity),
            policy,
        }
    }
}

impl StoresServerSessions for SessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        match self.policy {
            CachePolicy::Always => {
                trace!("caching established TLS session");
                self.inner.put(key, value)
            }
            CachePolicy::Never => false,
        }
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(key)
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.take(key)
    }

    fn can_cache(&self) -> bool {
        self.policy == CachePolicy::Always
    }
}
