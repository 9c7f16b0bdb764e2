use std::{fmt, sync::Arc};

use reqwest_middleware::ClientWithMiddleware;
use tokenward_clock::{Clock, System};

use super::{
    extend_parameters, Authority, ClientAssertionProvider, ClientRegistry, Credentials,
    FormRequest,
};
use crate::{
    dpop::{DPoPNonceStore, ProofService},
    ClientCredentialsToken, ClientNameRef, ConfigurationError, IssuedToken, TokenRequestError,
    TokenRequestParameters,
};

/// Requests tokens from an authority using the client credentials flow
pub struct ClientCredentialsTokenClient<C = System> {
    authority: Authority<C>,
    clients: ClientRegistry,
}

impl ClientCredentialsTokenClient {
    /// Constructs a client for the registered clients
    ///
    /// Nonces are remembered in process memory and no client assertions are
    /// used unless configured otherwise.
    pub fn new(http: impl Into<ClientWithMiddleware>, clients: ClientRegistry) -> Self {
        Self {
            authority: Authority::new(http.into()),
            clients,
        }
    }
}

impl<C> ClientCredentialsTokenClient<C> {
    /// Uses the provided clock
    pub fn with_clock<D: Clone>(self, clock: D) -> ClientCredentialsTokenClient<D> {
        ClientCredentialsTokenClient {
            authority: self.authority.with_clock(clock),
            clients: self.clients,
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

    /// The registered clients
    #[inline]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }
}

impl<C: fmt::Debug> fmt::Debug for ClientCredentialsTokenClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientCredentialsTokenClient")
            .field("authority", &self.authority)
            .field("clients", &self.clients)
            .finish()
    }
}

impl<C: Clock> ClientCredentialsTokenClient<C> {
    /// Requests a new token for the named client, bypassing any cache
    ///
    /// Per-call scope and resource override the client's configured values,
    /// and per-call form parameters override the client's parameters.
    #[tracing::instrument(
        err,
        skip(self, parameters),
        fields(
            client.name = %client_name,
            scope = tracing::field::Empty,
            resource = tracing::field::Empty,
        ),
    )]
    pub async fn request_access_token(
        &self,
        client_name: &ClientNameRef,
        parameters: &TokenRequestParameters,
    ) -> Result<ClientCredentialsToken, TokenRequestError> {
        let client = self
            .clients
            .get(client_name)
            .ok_or_else(|| ConfigurationError::UnknownClient(client_name.to_owned()))?;
        let token_endpoint = client
            .token_endpoint
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingTokenEndpoint(client_name.to_string()))?;
        let client_id = client
            .client_id
            .as_deref()
            .ok_or_else(|| ConfigurationError::MissingClientId(client_name.to_string()))?;

        let assertion = self.authority.assertion(Some(client_name), parameters).await?;
        let credentials = match (&assertion, &client.client_secret) {
            (Some(assertion), _) => Credentials::Assertion(assertion),
            (None, Some(secret)) => Credentials::Secret {
                secret,
                style: client.credential_style,
            },
            (None, None) => {
                return Err(
                    ConfigurationError::MissingClientCredentials(client_name.to_string()).into(),
                )
            }
        };

        let mut form = vec![("grant_type", "client_credentials")];

        let scope = parameters.scope().or(client.scope.as_deref());
        if let Some(scope) = scope {
            tracing::Span::current().record("scope", scope.as_str());
            form.push(("scope", scope.as_str()));
        }

        let resource = parameters.resource().or(client.resource.as_deref());
        if let Some(resource) = resource {
            tracing::Span::current().record("resource", resource.as_str());
            form.push(("resource", resource.as_str()));
        }

        extend_parameters(&mut form, &client.parameters, &parameters.parameters);

        tracing::trace!("requesting token from authority");

        let request = FormRequest {
            endpoint: token_endpoint,
            client_id,
            credentials,
            form,
            dpop_key: client.dpop_key.as_ref(),
        };
        let response = self.authority.post_form(&request).await?;

        if !response.status.is_success() {
            return Err(response.into_error());
        }

        let body: super::dto::TokenResponse = serde_json::from_slice(&response.body)?;
        let token = body.into_client_credentials_token(
            self.authority.clock.now(),
            client_id,
            client.dpop_key.as_ref(),
        )?;

        tracing::info!(
            expiration = %token.expiration(),
            dpop = token.uses_dpop(),
            "received new access token"
        );

        Ok(token)
    }
}
