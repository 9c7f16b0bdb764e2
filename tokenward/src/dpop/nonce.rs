use std::{fmt, sync::Arc};

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::Deserialize;
use tokenward_clock::DurationSecs;

use crate::{
    cache::{CacheKey, CacheStore, InMemoryCache},
    DPoPNonce, DPoPNonceRef,
};

/// How long a server-issued nonce is remembered
const NONCE_LIFETIME: DurationSecs = DurationSecs(60 * 60);

/// The target of a request, for the purposes of remembering DPoP nonces
///
/// Nonces are tracked per HTTP method and URL, ignoring any query string or
/// fragment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NonceContext {
    method: String,
    url: String,
}

impl NonceContext {
    /// Constructs the context for a request
    pub fn new(url: &Url, method: &Method) -> Self {
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: target_uri(url),
        }
    }

    /// The uppercased HTTP method
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The URL, without query string or fragment
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Strips the query string and fragment from a URL
pub(crate) fn target_uri(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.into()
}

/// Remembers the most recent nonce issued for each request target
#[async_trait]
pub trait DPoPNonceStore: Send + Sync + fmt::Debug {
    /// Gets the remembered nonce for a request target
    async fn get_nonce(&self, context: &NonceContext) -> Option<DPoPNonce>;

    /// Remembers a nonce for a request target
    async fn store_nonce(&self, context: &NonceContext, nonce: &DPoPNonceRef);
}

/// Options for [`CachedNonceStore`]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NonceStoreOptions {
    /// The prefix for nonce cache keys
    pub key_prefix: String,
}

impl Default for NonceStoreOptions {
    fn default() -> Self {
        Self {
            key_prefix: "tokenward::dpop_nonce".to_owned(),
        }
    }
}

/// A nonce store backed by a [`CacheStore`]
///
/// Nonces expire an hour after they are stored. Failures of the underlying
/// store are logged and treated as if no nonce were stored.
pub struct CachedNonceStore {
    cache: Arc<dyn CacheStore<String>>,
    options: NonceStoreOptions,
}

impl CachedNonceStore {
    /// Constructs a nonce store over the provided cache
    pub fn new(cache: Arc<dyn CacheStore<String>>, options: NonceStoreOptions) -> Self {
        Self { cache, options }
    }

    /// Constructs a nonce store kept in process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCache::new()), NonceStoreOptions::default())
    }

    fn key(&self, context: &NonceContext) -> CacheKey {
        CacheKey::from(format!(
            "{}::{}::{}",
            self.options.key_prefix, context.method, context.url
        ))
    }
}

impl fmt::Debug for CachedNonceStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CachedNonceStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DPoPNonceStore for CachedNonceStore {
    async fn get_nonce(&self, context: &NonceContext) -> Option<DPoPNonce> {
        let key = self.key(context);
        let raw = match self.cache.get(&key).await {
            Ok(raw) => raw?,
            Err(error) => {
                tracing::warn!(nonce.key = %key, %error, "unable to read DPoP nonce");
                return None;
            }
        };

        match DPoPNonce::new(raw) {
            Ok(nonce) => Some(nonce),
            Err(error) => {
                tracing::warn!(nonce.key = %key, %error, "discarding unreadable DPoP nonce");
                None
            }
        }
    }

    async fn store_nonce(&self, context: &NonceContext, nonce: &DPoPNonceRef) {
        let key = self.key(context);
        tracing::trace!(nonce.key = %key, "storing DPoP nonce");

        if let Err(error) = self
            .cache
            .set(&key, nonce.as_str().to_owned(), NONCE_LIFETIME)
            .await
        {
            tracing::warn!(nonce.key = %key, %error, "unable to store DPoP nonce");
        }
    }
}
