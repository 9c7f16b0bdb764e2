use std::{collections::BTreeMap, fmt, sync::Arc};

use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tokenward_clock::{Clock, System};

use super::{
    extend_parameters, Authority, ClientAssertionProvider, ClientCredentialStyle, Credentials,
    FormRequest,
};
use crate::{
    dpop::{DPoPNonceStore, ProofKey, ProofService},
    ClientAssertion, ClientId, ClientIdRef, ClientSecret, ConfigurationError, IssuedToken, RefreshTokenRef,
    TokenRequestError, TokenRequestParameters, UserToken,
};

/// The client and endpoints used to manage tokens on behalf of users
///
/// The endpoints are normally taken from the authority's discovery document.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct UserClientConfiguration {
    /// The authority's token endpoint
    pub token_endpoint: Option<Url>,
    /// The authority's revocation endpoint
    pub revocation_endpoint: Option<Url>,
    /// The client ID
    pub client_id: Option<ClientId>,
    /// The client secret; public clients have none
    pub client_secret: Option<ClientSecret>,
    /// How the client secret is presented
    pub credential_style: ClientCredentialStyle,
    /// Additional form parameters sent with every request
    pub parameters: BTreeMap<String, String>,
    /// A key to bind issued tokens to using DPoP
    pub dpop_key: Option<ProofKey>,
}

impl UserClientConfiguration {
    fn client_id(&self) -> Result<&ClientIdRef, ConfigurationError> {
        self.client_id
            .as_deref()
            .ok_or_else(|| ConfigurationError::MissingClientId(self.label()))
    }

    fn label(&self) -> String {
        self.client_id
            .as_ref()
            .map_or_else(|| "<user client>".to_owned(), ToString::to_string)
    }

    fn credentials<'a>(&'a self, assertion: &'a Option<ClientAssertion>) -> Credentials<'a> {
        match (assertion, &self.client_secret) {
            (Some(assertion), _) => Credentials::Assertion(assertion),
            (None, Some(secret)) => Credentials::Secret {
                secret,
                style: self.credential_style,
            },
            (None, None) => Credentials::Public,
        }
    }
}

/// Refreshes and revokes tokens issued to users
pub struct UserTokenEndpoint<C = System> {
    authority: Authority<C>,
}

impl UserTokenEndpoint {
    /// Constructs an endpoint client
    pub fn new(http: impl Into<ClientWithMiddleware>) -> Self {
        Self {
            authority: Authority::new(http.into()),
        }
    }
}

impl<C> UserTokenEndpoint<C> {
    /// Uses the provided clock
    pub fn with_clock<D: Clone>(self, clock: D) -> UserTokenEndpoint<D> {
        UserTokenEndpoint {
            authority: self.authority.with_clock(clock),
        }
    }

    /// Remembers DPoP nonces in the provided store
    pub fn with_nonce_store(mut self, nonces: Arc<dyn DPoPNonceStore>) -> Self
    where
        C: Clone,
    {
        self.authority = self.authority.with_nonce_store(nonces);
        self
    }

    /// Obtains client assertions from the provided source
    pub fn with_assertion_provider(mut self, assertions: Arc<dyn ClientAssertionProvider>) -> Self {
        self.authority = self.authority.with_assertion_provider(assertions);
        self
    }

    /// The service used to create DPoP proofs
    #[inline]
    pub fn proof_service(&self) -> &Arc<ProofService<C>> {
        &self.authority.proofs
    }

    /// The clock used to compute token expirations
    #[inline]
    pub fn clock(&self) -> &C {
        &self.authority.clock
    }
}

impl<C: fmt::Debug> fmt::Debug for UserTokenEndpoint<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UserTokenEndpoint")
            .field("authority", &self.authority)
            .finish()
    }
}

impl<C: Clock> UserTokenEndpoint<C> {
    /// Redeems a refresh token for a new access token
    ///
    /// If the authority does not rotate the refresh token, the returned token
    /// carries the one that was redeemed.
    #[tracing::instrument(err, skip_all, fields(client.id = %configuration.label()))]
    pub async fn refresh_access_token(
        &self,
        configuration: &UserClientConfiguration,
        refresh_token: &RefreshTokenRef,
        parameters: &TokenRequestParameters,
    ) -> Result<UserToken, TokenRequestError> {
        let token_endpoint = configuration
            .token_endpoint
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingTokenEndpoint(configuration.label()))?;
        let client_id = configuration.client_id()?;
        let assertion = self.authority.assertion(None, parameters).await?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        if let Some(scope) = parameters.scope() {
            form.push(("scope", scope.as_str()));
        }
        if let Some(resource) = parameters.resource() {
            form.push(("resource", resource.as_str()));
        }
        extend_parameters(&mut form, &configuration.parameters, &parameters.parameters);

        tracing::trace!("refreshing token with authority");

        let request = FormRequest {
            endpoint: token_endpoint,
            client_id,
            credentials: configuration.credentials(&assertion),
            form,
            dpop_key: configuration.dpop_key.as_ref(),
        };
        let response = self.authority.post_form(&request).await?;

        if !response.status.is_success() {
            return Err(response.into_error());
        }

        let body: super::dto::TokenResponse = serde_json::from_slice(&response.body)?;
        let rotated = body.has_refresh_token();
        let mut token =
            body.into_user_token(self.authority.clock.now(), configuration.dpop_key.as_ref())?;
        if !rotated {
            token = token.with_refresh_token(refresh_token.to_owned());
        }

        tracing::info!(
            expiration = %token.expiration(),
            rotated,
            "received refreshed access token"
        );

        Ok(token)
    }

    /// Revokes a refresh token
    #[tracing::instrument(err, skip_all, fields(client.id = %configuration.label()))]
    pub async fn revoke_refresh_token(
        &self,
        configuration: &UserClientConfiguration,
        refresh_token: &RefreshTokenRef,
        parameters: &TokenRequestParameters,
    ) -> Result<(), TokenRequestError> {
        let revocation_endpoint = configuration
            .revocation_endpoint
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingRevocationEndpoint(configuration.label()))?;
        let client_id = configuration.client_id()?;
        let assertion = self.authority.assertion(None, parameters).await?;

        let request = FormRequest {
            endpoint: revocation_endpoint,
            client_id,
            credentials: configuration.credentials(&assertion),
            form: vec![
                ("token", refresh_token.as_str()),
                ("token_type_hint", "refresh_token"),
            ],
            dpop_key: None,
        };
        let response = self.authority.post_form(&request).await?;

        if !response.status.is_success() {
            return Err(response.into_error());
        }

        tracing::info!("revoked refresh token");
        Ok(())
    }
}
