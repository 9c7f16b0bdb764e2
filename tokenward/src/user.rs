//! Token management on behalf of signed-in users
//!
//! A [`UserTokenManager`] keeps a user's access tokens fresh by redeeming
//! the refresh token held in a [`UserTokenStore`]. Refreshes of the same
//! refresh token for the same resource are coalesced into a single request,
//! and new tokens are written back to the store before any caller sees them.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokenward_clock::{Clock, DurationSecs, System};

pub use crate::endpoint::UserClientConfiguration;
use crate::{
    cache::{hash_segment, CacheKey, SingleFlight},
    endpoint::UserTokenEndpoint,
    error::BoxError,
    FailedResult, IssuedToken, RefreshToken, RefreshTokenRef, Resource, Subject, SubjectRef,
    TokenForParameters, TokenRequestError, TokenRequestParameters, UserToken,
};

/// The user on whose behalf tokens are requested
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Principal {
    subject: Option<Subject>,
}

impl Principal {
    /// A signed-in user
    pub fn authenticated(subject: Subject) -> Self {
        Self {
            subject: Some(subject),
        }
    }

    /// Nobody is signed in
    pub fn anonymous() -> Self {
        Self { subject: None }
    }

    /// The user's subject identifier
    #[inline]
    pub fn subject(&self) -> Option<&SubjectRef> {
        self.subject.as_deref()
    }

    /// Whether a user is signed in
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.subject.is_some()
    }
}

/// Where user tokens are kept between requests
///
/// This is typically the user's session.
#[async_trait]
pub trait UserTokenStore: Send + Sync + fmt::Debug {
    /// Stores a token issued to the user for the given parameters
    async fn store_token(
        &self,
        subject: &SubjectRef,
        token: &UserToken,
        parameters: &TokenRequestParameters,
    ) -> Result<(), BoxError>;

    /// Gets whatever is stored for the user and parameters
    async fn get_token(
        &self,
        subject: &SubjectRef,
        parameters: &TokenRequestParameters,
    ) -> Result<TokenForParameters, BoxError>;

    /// Forgets the user's tokens
    async fn clear_token(
        &self,
        subject: &SubjectRef,
        parameters: &TokenRequestParameters,
    ) -> Result<(), BoxError>;
}

#[derive(Debug, Default)]
struct StoredTokens {
    refresh_token: Option<RefreshToken>,
    by_resource: HashMap<Option<Resource>, UserToken>,
}

/// A process-local user token store
///
/// Access tokens are kept per resource. The most recent refresh token is
/// shared by every resource.
#[derive(Debug, Default)]
pub struct InMemoryUserTokenStore {
    users: DashMap<Subject, StoredTokens>,
}

impl InMemoryUserTokenStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserTokenStore for InMemoryUserTokenStore {
    async fn store_token(
        &self,
        subject: &SubjectRef,
        token: &UserToken,
        parameters: &TokenRequestParameters,
    ) -> Result<(), BoxError> {
        let mut stored = self.users.entry(subject.to_owned()).or_default();
        if let Some(refresh_token) = token.refresh_token() {
            stored.refresh_token = Some(refresh_token.to_owned());
        }
        stored
            .by_resource
            .insert(parameters.resource().map(ToOwned::to_owned), token.clone());
        Ok(())
    }

    async fn get_token(
        &self,
        subject: &SubjectRef,
        parameters: &TokenRequestParameters,
    ) -> Result<TokenForParameters, BoxError> {
        let Some(stored) = self.users.get(subject) else {
            return Ok(TokenForParameters::default());
        };

        let resource = parameters.resource().map(ToOwned::to_owned);
        Ok(TokenForParameters {
            token: stored.by_resource.get(&resource).cloned(),
            refresh_token: stored.refresh_token.clone(),
        })
    }

    async fn clear_token(
        &self,
        subject: &SubjectRef,
        _: &TokenRequestParameters,
    ) -> Result<(), BoxError> {
        self.users.remove(subject);
        Ok(())
    }
}

/// Options controlling when user tokens are refreshed
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UserTokenManagementOptions {
    /// How long before expiry a token is refreshed
    pub refresh_before_expiration: DurationSecs,
}

impl Default for UserTokenManagementOptions {
    fn default() -> Self {
        Self {
            refresh_before_expiration: DurationSecs(60),
        }
    }
}

/// Hands out access tokens for signed-in users, refreshing them as needed
pub struct UserTokenManager<C = System> {
    endpoint: UserTokenEndpoint<C>,
    configuration: UserClientConfiguration,
    store: Arc<dyn UserTokenStore>,
    refreshes: SingleFlight<Result<UserToken, TokenRequestError>>,
    options: UserTokenManagementOptions,
}

impl<C> UserTokenManager<C> {
    /// Constructs a manager
    pub fn new(
        endpoint: UserTokenEndpoint<C>,
        configuration: UserClientConfiguration,
        store: Arc<dyn UserTokenStore>,
        options: UserTokenManagementOptions,
    ) -> Self {
        Self {
            endpoint,
            configuration,
            store,
            refreshes: SingleFlight::new(),
            options,
        }
    }

    /// The endpoint client used to refresh and revoke tokens
    #[inline]
    pub fn endpoint(&self) -> &UserTokenEndpoint<C> {
        &self.endpoint
    }

    /// The store holding users' tokens
    #[inline]
    pub fn store(&self) -> &Arc<dyn UserTokenStore> {
        &self.store
    }
}

impl<C: fmt::Debug> fmt::Debug for UserTokenManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UserTokenManager")
            .field("endpoint", &self.endpoint)
            .field("configuration", &self.configuration)
            .field("store", &self.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn store_error(error: BoxError) -> TokenRequestError {
    TokenRequestError::Store(Arc::from(error))
}

impl<C: Clock> UserTokenManager<C> {
    /// Gets an access token for the user
    ///
    /// A stored token is returned while it is fresh. Otherwise, or when
    /// renewal is forced, the stored refresh token is redeemed and the new
    /// token stored. A token that cannot be refreshed is returned as is.
    #[tracing::instrument(
        level = "debug",
        err,
        skip_all,
        fields(user.subject = ?principal.subject(), force = parameters.force_token_renewal),
    )]
    pub async fn get_access_token(
        &self,
        principal: &Principal,
        parameters: &TokenRequestParameters,
    ) -> Result<UserToken, TokenRequestError> {
        let subject = principal
            .subject()
            .ok_or_else(|| TokenRequestError::rejected(FailedResult::NO_ACTIVE_USER))?;

        let stored = self
            .store
            .get_token(subject, parameters)
            .await
            .map_err(store_error)?;

        let refresh_token = stored.usable_refresh_token().map(ToOwned::to_owned);

        let refresh_token = match (stored.token, refresh_token) {
            (None, None) => {
                tracing::debug!("no token data stored for user");
                return Err(TokenRequestError::rejected(FailedResult::NO_TOKEN_DATA));
            }
            (Some(token), None) => {
                tracing::debug!("no refresh token stored; returning stored access token");
                return Ok(token);
            }
            (Some(token), Some(_))
                if !parameters.force_token_renewal
                    && !token.expires_within(
                        self.options.refresh_before_expiration,
                        self.endpoint.clock().now(),
                    ) =>
            {
                tracing::trace!("stored access token is fresh");
                return Ok(token);
            }
            (_, Some(refresh_token)) => refresh_token,
        };

        self.refresh(subject, &refresh_token, parameters).await
    }

    /// Revokes the user's refresh token and forgets their tokens
    #[tracing::instrument(level = "debug", err, skip_all, fields(user.subject = ?principal.subject()))]
    pub async fn revoke_refresh_token(
        &self,
        principal: &Principal,
        parameters: &TokenRequestParameters,
    ) -> Result<(), TokenRequestError> {
        let subject = principal
            .subject()
            .ok_or_else(|| TokenRequestError::rejected(FailedResult::NO_ACTIVE_USER))?;

        let stored = self
            .store
            .get_token(subject, parameters)
            .await
            .map_err(store_error)?;

        if let Some(refresh_token) = stored.usable_refresh_token() {
            self.endpoint
                .revoke_refresh_token(&self.configuration, refresh_token, parameters)
                .await?;
        } else {
            tracing::debug!("no refresh token stored; nothing to revoke");
        }

        self.store
            .clear_token(subject, parameters)
            .await
            .map_err(store_error)
    }

    async fn refresh(
        &self,
        subject: &SubjectRef,
        refresh_token: &RefreshTokenRef,
        parameters: &TokenRequestParameters,
    ) -> Result<UserToken, TokenRequestError> {
        let key = CacheKey::from(format!(
            "{}::resource:{}",
            hash_segment(refresh_token.as_str()),
            parameters.resource().map(|r| hash_segment(r.as_str())).unwrap_or_default(),
        ));

        self.refreshes
            .run(&key, || async {
                let token = self
                    .endpoint
                    .refresh_access_token(&self.configuration, refresh_token, parameters)
                    .await?;

                self.store
                    .store_token(subject, &token, parameters)
                    .await
                    .map_err(store_error)?;

                Ok(token)
            })
            .await
    }
}
