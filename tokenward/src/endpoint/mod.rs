//! Clients for OAuth2 token and revocation endpoints

use std::{collections::BTreeMap, collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::ACCEPT, Method, StatusCode, Url};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tokenward_clock::{Clock, System};

use crate::{
    dpop::{
        self, DPoPNonceStore, NonceContext, ProofKey, ProofRequest, ProofService,
        INVALID_DPOP_PROOF, USE_DPOP_NONCE,
    },
    error::BoxError,
    ClientAssertion, ClientId, ClientIdRef, ClientName, ClientNameRef, ClientSecret,
    ClientSecretRef, DPoPNonce, FailedResult, Resource, Scope, TokenRequestError,
    TokenRequestParameters,
};

mod client_credentials;
pub(crate) mod dto;
mod user;

pub use client_credentials::ClientCredentialsTokenClient;
pub use user::{UserClientConfiguration, UserTokenEndpoint};

/// How a client authenticates to the token endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCredentialStyle {
    /// HTTP Basic authentication with the form-encoded client ID and secret
    AuthorizationHeader,
    /// `client_id` and `client_secret` form parameters
    #[default]
    PostBody,
}

/// The configuration of a client using the client credentials flow
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientCredentialsClient {
    /// The authority's token endpoint
    pub token_endpoint: Option<Url>,
    /// The client ID
    pub client_id: Option<ClientId>,
    /// The client secret; not needed when using client assertions
    pub client_secret: Option<ClientSecret>,
    /// How the client secret is presented
    pub credential_style: ClientCredentialStyle,
    /// The scope requested when a call does not specify one
    pub scope: Option<Scope>,
    /// The resource requested when a call does not specify one
    pub resource: Option<Resource>,
    /// Additional form parameters sent with every request
    pub parameters: BTreeMap<String, String>,
    /// A key to bind issued tokens to using DPoP
    pub dpop_key: Option<ProofKey>,
}

/// Named client configurations
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct ClientRegistry {
    clients: HashMap<ClientName, ClientCredentialsClient>,
}

impl ClientRegistry {
    /// Constructs an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client under `name`
    pub fn with_client(mut self, name: ClientName, client: ClientCredentialsClient) -> Self {
        self.clients.insert(name, client);
        self
    }

    /// Gets the client registered under `name`
    pub fn get(&self, name: &ClientNameRef) -> Option<&ClientCredentialsClient> {
        self.clients.get(name)
    }
}

impl FromIterator<(ClientName, ClientCredentialsClient)> for ClientRegistry {
    fn from_iter<I: IntoIterator<Item = (ClientName, ClientCredentialsClient)>>(iter: I) -> Self {
        Self {
            clients: iter.into_iter().collect(),
        }
    }
}

/// Supplies client assertions used to authenticate in place of a client secret
#[async_trait]
pub trait ClientAssertionProvider: Send + Sync + fmt::Debug {
    /// Gets an assertion for the named client, or `None` to fall back to its secret
    ///
    /// User token flows do not have a client name.
    async fn client_assertion(
        &self,
        client_name: Option<&ClientNameRef>,
        parameters: &TokenRequestParameters,
    ) -> Result<Option<ClientAssertion>, BoxError>;
}

/// An assertion provider which never provides assertions
#[derive(Clone, Copy, Debug, Default)]
pub struct NoClientAssertions;

#[async_trait]
impl ClientAssertionProvider for NoClientAssertions {
    async fn client_assertion(
        &self,
        _: Option<&ClientNameRef>,
        _: &TokenRequestParameters,
    ) -> Result<Option<ClientAssertion>, BoxError> {
        Ok(None)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Credentials<'a> {
    Secret {
        secret: &'a ClientSecretRef,
        style: ClientCredentialStyle,
    },
    Assertion(&'a ClientAssertion),
    Public,
}

/// A form post to a token or revocation endpoint
#[derive(Debug)]
pub(crate) struct FormRequest<'a> {
    pub(crate) endpoint: &'a Url,
    pub(crate) client_id: &'a ClientIdRef,
    pub(crate) credentials: Credentials<'a>,
    pub(crate) form: Vec<(&'a str, &'a str)>,
    pub(crate) dpop_key: Option<&'a ProofKey>,
}

#[derive(Debug)]
pub(crate) struct RawResponse {
    pub(crate) status: StatusCode,
    pub(crate) nonce: Option<DPoPNonce>,
    pub(crate) body: Bytes,
}

impl RawResponse {
    /// Interprets an unsuccessful response as an OAuth2 error, if possible
    pub(crate) fn into_error(self) -> TokenRequestError {
        match serde_json::from_slice::<FailedResult>(&self.body) {
            Ok(failed) => TokenRequestError::Rejected(failed),
            Err(_) => TokenRequestError::ErrorWithBody {
                status: self.status.as_u16(),
                body: String::from_utf8_lossy(&self.body).into_owned(),
            },
        }
    }

    /// The nonce to retry with, if this is a token endpoint nonce demand
    fn nonce_challenge(&self) -> Option<DPoPNonce> {
        if self.status.is_success() {
            return None;
        }

        let failed: FailedResult = serde_json::from_slice(&self.body).ok()?;
        if failed.error == USE_DPOP_NONCE || failed.error == INVALID_DPOP_PROOF {
            self.nonce.clone()
        } else {
            None
        }
    }
}

/// Form parameters that callers cannot override
const RESERVED_PARAMETERS: [&str; 9] = [
    "grant_type",
    "scope",
    "resource",
    "refresh_token",
    "token",
    "client_id",
    "client_secret",
    "client_assertion",
    "client_assertion_type",
];

/// Adds the client's and then the call's extra form parameters, with the
/// call's taking precedence
pub(crate) fn extend_parameters<'a>(
    form: &mut Vec<(&'a str, &'a str)>,
    configured: &'a BTreeMap<String, String>,
    per_call: &'a BTreeMap<String, String>,
) {
    let configured = configured
        .iter()
        .filter(|(name, _)| !per_call.contains_key(*name));

    for (name, value) in configured.chain(per_call) {
        if RESERVED_PARAMETERS.contains(&name.as_str()) {
            tracing::debug!(parameter = %name, "ignoring reserved form parameter");
        } else {
            form.push((name.as_str(), value.as_str()));
        }
    }
}

/// Form-encodes the client ID and secret for HTTP Basic authentication
fn basic_credentials(client_id: &ClientIdRef, secret: &ClientSecretRef) -> (String, String) {
    let encode = |value: &str| url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
    (encode(client_id.as_str()), encode(secret.as_str()))
}

/// The machinery shared by every endpoint client
pub(crate) struct Authority<C> {
    pub(crate) http: ClientWithMiddleware,
    pub(crate) proofs: Arc<ProofService<C>>,
    pub(crate) assertions: Arc<dyn ClientAssertionProvider>,
    pub(crate) clock: C,
}

impl Authority<System> {
    pub(crate) fn new(http: ClientWithMiddleware) -> Self {
        Self {
            http,
            proofs: Arc::new(ProofService::default()),
            assertions: Arc::new(NoClientAssertions),
            clock: System,
        }
    }
}

impl<C> Authority<C> {
    pub(crate) fn with_clock<D: Clone>(self, clock: D) -> Authority<D> {
        Authority {
            http: self.http,
            proofs: Arc::new(ProofService::with_clock(
                Arc::clone(self.proofs.nonce_store()),
                clock.clone(),
            )),
            assertions: self.assertions,
            clock,
        }
    }

    pub(crate) fn with_nonce_store(mut self, nonces: Arc<dyn DPoPNonceStore>) -> Self
    where
        C: Clone,
    {
        self.proofs = Arc::new(ProofService::with_clock(nonces, self.clock.clone()));
        self
    }

    pub(crate) fn with_assertion_provider(
        mut self,
        assertions: Arc<dyn ClientAssertionProvider>,
    ) -> Self {
        self.assertions = assertions;
        self
    }

    /// Picks an explicit assertion, then a provided one
    pub(crate) async fn assertion(
        &self,
        client_name: Option<&ClientNameRef>,
        parameters: &TokenRequestParameters,
    ) -> Result<Option<ClientAssertion>, TokenRequestError> {
        if let Some(assertion) = &parameters.assertion {
            return Ok(Some(assertion.clone()));
        }

        self.assertions
            .client_assertion(client_name, parameters)
            .await
            .map_err(|err| TokenRequestError::Assertion(Arc::from(err)))
    }
}

impl<C: fmt::Debug> fmt::Debug for Authority<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Authority")
            .field("proofs", &self.proofs)
            .field("assertions", &self.assertions)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> Authority<C> {
    /// Posts a form, resending once if the endpoint demands a DPoP nonce
    ///
    /// Any nonce the endpoint hands out on the final response is remembered
    /// for later requests.
    pub(crate) async fn post_form(
        &self,
        request: &FormRequest<'_>,
    ) -> Result<RawResponse, TokenRequestError> {
        let challenge = |response: &RawResponse| {
            request
                .dpop_key
                .and_then(|_| response.nonce_challenge())
        };

        let response =
            dpop::retry_with_nonce(|nonce| self.post_form_once(request, nonce), challenge).await?;

        if let (Some(_), Some(nonce)) = (request.dpop_key, &response.nonce) {
            let context = NonceContext::new(request.endpoint, &Method::POST);
            self.proofs.nonce_store().store_nonce(&context, nonce).await;
        }

        Ok(response)
    }

    async fn post_form_once(
        &self,
        request: &FormRequest<'_>,
        nonce: Option<DPoPNonce>,
    ) -> Result<RawResponse, TokenRequestError> {
        let mut form = request.form.clone();
        let mut builder = self
            .http
            .post(request.endpoint.clone())
            .header(ACCEPT, "application/json");

        match request.credentials {
            Credentials::Secret {
                secret,
                style: ClientCredentialStyle::AuthorizationHeader,
            } => {
                let (username, password) = basic_credentials(request.client_id, secret);
                builder = builder.basic_auth(username, Some(password));
            }
            Credentials::Secret {
                secret,
                style: ClientCredentialStyle::PostBody,
            } => {
                form.push(("client_id", request.client_id.as_str()));
                form.push(("client_secret", secret.as_str()));
            }
            Credentials::Assertion(assertion) => {
                form.push(("client_id", request.client_id.as_str()));
                form.push(("client_assertion_type", assertion.assertion_type.as_str()));
                form.push(("client_assertion", assertion.value.as_str()));
            }
            Credentials::Public => {
                form.push(("client_id", request.client_id.as_str()));
            }
        }

        let proof = self
            .proofs
            .create_proof_token(
                ProofRequest::new(request.endpoint, &Method::POST)
                    .with_key(request.dpop_key)
                    .with_nonce(nonce.as_deref()),
            )
            .await?;
        if let Some(proof) = &proof {
            builder = builder.header(dpop::DPOP_HEADER, proof.as_str());
        }

        tracing::trace!(has_proof = proof.is_some(), "posting to authority");

        let resp = builder.form(&form).send().await?;
        let status = resp.status();

        tracing::debug!(
            response.status = status.as_u16(),
            "received response from issuing authority"
        );

        let nonce = dpop::nonce_from_headers(resp.headers());
        let body = resp
            .bytes()
            .await
            .map_err(|err| TokenRequestError::BodyRead(Arc::new(err)))?;

        Ok(RawResponse {
            status,
            nonce,
            body,
        })
    }
}
