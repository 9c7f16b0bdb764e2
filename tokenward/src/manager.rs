//! Cached client credentials token management

use std::{fmt, sync::Arc};

use serde::Deserialize;
use tokenward_clock::{Clock, DurationSecs, System};

use crate::{
    cache::{
        CacheDurationTuner, CacheEntryOptions, CacheKey, CacheRead, CacheStore,
        ClientCredentialsCacheKeyGenerator, FetchOutcome, TokenCache,
    },
    endpoint::ClientCredentialsTokenClient,
    ClientCredentialsToken, ClientNameRef, IssuedToken, TokenRequestError, TokenRequestParameters,
};

/// How many times an already-expired token is re-requested before it is
/// returned anyway
const MAX_EXPIRED_TOKEN_RETRIES: u8 = 1;

/// Options controlling how client credentials tokens are cached
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientCredentialsTokenManagementOptions {
    /// The prefix for cache keys
    pub cache_key_prefix: String,
    /// How long tokens are cached before their lifetime is known
    pub default_cache_lifetime: DurationSecs,
    /// How long before expiry a token stops being handed out
    pub cache_lifetime_buffer: DurationSecs,
    /// Learn cache lifetimes from the tokens the authority issues
    pub use_cache_auto_tuning: bool,
    /// An upper bound on how long tokens stay in the in-process cache
    pub local_cache_expiration: Option<DurationSecs>,
}

impl Default for ClientCredentialsTokenManagementOptions {
    fn default() -> Self {
        Self {
            cache_key_prefix: "tokenward::client_credentials".to_owned(),
            default_cache_lifetime: DurationSecs(60 * 60),
            cache_lifetime_buffer: DurationSecs(60),
            use_cache_auto_tuning: true,
            local_cache_expiration: None,
        }
    }
}

/// Hands out cached client credentials tokens, requesting new ones as needed
///
/// Concurrent requests for the same client, scope, and resource share a
/// single request to the authority. Failed requests are reported to every
/// waiting caller and are never cached.
pub struct ClientCredentialsTokenManager<C = System> {
    client: ClientCredentialsTokenClient<C>,
    cache: TokenCache<ClientCredentialsToken, TokenRequestError, C>,
    keys: ClientCredentialsCacheKeyGenerator,
    tuner: Arc<CacheDurationTuner>,
    options: ClientCredentialsTokenManagementOptions,
}

impl<C: Clone> ClientCredentialsTokenManager<C> {
    /// Constructs a manager with only an in-process cache
    pub fn new(
        client: ClientCredentialsTokenClient<C>,
        options: ClientCredentialsTokenManagementOptions,
    ) -> Self {
        Self {
            cache: TokenCache::with_clock(client.clock().clone()),
            keys: ClientCredentialsCacheKeyGenerator::new(options.cache_key_prefix.clone()),
            tuner: Arc::new(CacheDurationTuner::new()),
            client,
            options,
        }
    }
}

impl<C> ClientCredentialsTokenManager<C> {
    /// Also caches tokens in a distributed store
    pub fn with_distributed_cache(
        mut self,
        store: Arc<dyn CacheStore<ClientCredentialsToken>>,
    ) -> Self {
        self.cache = self.cache.with_distributed(store);
        self
    }

    /// Shares learned cache lifetimes with other managers
    pub fn with_tuner(mut self, tuner: Arc<CacheDurationTuner>) -> Self {
        self.tuner = tuner;
        self
    }

    /// The client used to request tokens
    #[inline]
    pub fn client(&self) -> &ClientCredentialsTokenClient<C> {
        &self.client
    }

    /// The cache key for a client and set of parameters
    pub fn cache_key(
        &self,
        client_name: &ClientNameRef,
        parameters: &TokenRequestParameters,
    ) -> CacheKey {
        self.keys.generate_key(client_name, parameters)
    }
}

impl<C: fmt::Debug> fmt::Debug for ClientCredentialsTokenManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientCredentialsTokenManager")
            .field("client", &self.client)
            .field("cache", &self.cache)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> ClientCredentialsTokenManager<C> {
    /// Gets a token for the named client, from the cache if possible
    ///
    /// A token is requested from the authority when none is cached or when
    /// renewal is forced. If the token obtained is already within the cache
    /// lifetime buffer of expiring, one more forced request is made.
    #[tracing::instrument(
        level = "debug",
        err,
        skip(self, parameters),
        fields(client.name = %client_name, force = parameters.force_token_renewal),
    )]
    pub async fn get_access_token(
        &self,
        client_name: &ClientNameRef,
        parameters: &TokenRequestParameters,
    ) -> Result<ClientCredentialsToken, TokenRequestError> {
        let key = self.cache_key(client_name, parameters);
        let ttl = self.cache_lifetime(&key);
        let options = CacheEntryOptions {
            local_expiration: self.options.local_cache_expiration,
            ttl,
        };

        let mut force = parameters.force_token_renewal;
        let mut token = self.fetch(client_name, parameters, &key, force, &options).await?;

        let mut retries = 0;
        let buffer = self.options.cache_lifetime_buffer;
        while !force
            && retries < MAX_EXPIRED_TOKEN_RETRIES
            && token.expires_within(buffer, self.client.clock().now())
        {
            tracing::debug!(
                expiration = %token.expiration(),
                "cached token has expired; forcing renewal"
            );
            force = true;
            retries += 1;
            token = self.fetch(client_name, parameters, &key, force, &options).await?;
        }

        Ok(token)
    }

    /// Removes any cached token for the named client and parameters
    #[tracing::instrument(level = "debug", skip(self, parameters), fields(client.name = %client_name))]
    pub async fn delete_access_token(
        &self,
        client_name: &ClientNameRef,
        parameters: &TokenRequestParameters,
    ) {
        let key = self.cache_key(client_name, parameters);
        self.cache.remove(&key).await;
    }

    fn cache_lifetime(&self, key: &CacheKey) -> DurationSecs {
        if self.options.use_cache_auto_tuning {
            if let Some(duration) = self.tuner.duration(key) {
                return duration;
            }
        }

        self.options.default_cache_lifetime
    }

    async fn fetch(
        &self,
        client_name: &ClientNameRef,
        parameters: &TokenRequestParameters,
        key: &CacheKey,
        force: bool,
        options: &CacheEntryOptions,
    ) -> Result<ClientCredentialsToken, TokenRequestError> {
        let read = if force {
            CacheRead::Bypass
        } else {
            CacheRead::Allow
        };

        self.cache
            .get_or_create(key, read, options, || async {
                let token = match self.client.request_access_token(client_name, parameters).await {
                    Ok(token) => token,
                    Err(error) => return FetchOutcome::Failed(error),
                };

                let mut ttl = options.ttl;
                if self.options.use_cache_auto_tuning {
                    let now = self.client.clock().now();
                    if let Some(tuned) = self.tuner.record(
                        key,
                        token.expiration(),
                        now,
                        self.options.cache_lifetime_buffer,
                    ) {
                        ttl = tuned;
                    }
                }

                tracing::debug!(cache.key = %key, cache.ttl = %ttl, "caching new access token");
                FetchOutcome::Fresh { value: token, ttl }
            })
            .await
    }
}
