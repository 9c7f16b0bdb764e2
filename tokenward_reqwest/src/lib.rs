//! Middleware to automatically attach managed access tokens to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to attach
//! a token from an [`AccessTokenSource`] to each outbound request. Tokens
//! bound to a key with DPoP are sent with the `DPoP` scheme and a fresh proof.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! When the server answers `401 Unauthorized`, the request is sent once
//! more. If the server demanded a DPoP nonce, the same token is resent with
//! that nonce; otherwise a renewed token is requested first.
//!
//! ```
//! use std::sync::Arc;
//!
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tokenward::{
//!     endpoint::ClientRegistry, ClientCredentialsTokenClient,
//!     ClientCredentialsTokenManager, ClientName, TokenRequestParameters,
//! };
//! use tokenward_reqwest::{AccessTokenMiddleware, ClientCredentialsTokenSource};
//!
//! let manager = Arc::new(ClientCredentialsTokenManager::new(
//!     ClientCredentialsTokenClient::new(Client::new(), ClientRegistry::new()),
//!     Default::default(),
//! ));
//! let source = ClientCredentialsTokenSource::new(
//!     manager,
//!     ClientName::from_static("catalog"),
//!     TokenRequestParameters::new(),
//! );
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(source))
//!     .build();
//! # drop(client);
//! ```
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. These predicates can be composed together to
//! evaluate more complex requirements prior to attaching a token to a
//! request.
//!
//! ```
//! # use std::sync::Arc;
//! # use tokenward::{
//! #     endpoint::ClientRegistry, ClientCredentialsTokenClient,
//! #     ClientCredentialsTokenManager, ClientName, TokenRequestParameters,
//! # };
//! use tokenward_reqwest::{
//!     AccessTokenMiddleware, ClientCredentialsTokenSource, ExactHostMatch, HttpsOnly,
//! };
//! use predicates::prelude::PredicateBooleanExt;
//! # let manager = Arc::new(ClientCredentialsTokenManager::new(
//! #     ClientCredentialsTokenClient::new(reqwest::Client::new(), ClientRegistry::new()),
//! #     Default::default(),
//! # ));
//! # let source = ClientCredentialsTokenSource::new(
//! #     manager,
//! #     ClientName::from_static("catalog"),
//! #     TokenRequestParameters::new(),
//! # );
//!
//! AccessTokenMiddleware::new(source)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.example.com")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{
    header::{self, HeaderName, HeaderValue},
    Request, Response, StatusCode,
};
use reqwest_middleware::{Error, Middleware, Next, Result};
use tokenward::{
    dpop::{self, NonceContext, ProofError, ProofRequest},
    user::Principal,
    ClientCredentialsToken, ClientCredentialsTokenManager, ClientName, DPoPNonce, DPoPNonceRef,
    IssuedToken, ProofToken, TokenRequestError, TokenRequestParameters, UserToken,
    UserTokenManager,
};
use tokenward_clock::{Clock, System};

/// Provides tokens, and proofs for them, to the middleware
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// The kind of token provided
    type Token: IssuedToken + Send + Sync;

    /// Gets a token for a request with the given extensions
    async fn access_token(
        &self,
        extensions: &http::Extensions,
        force_renewal: bool,
    ) -> std::result::Result<Self::Token, TokenRequestError>;

    /// Creates a DPoP proof for a request
    async fn proof_token(
        &self,
        request: ProofRequest<'_>,
    ) -> std::result::Result<Option<ProofToken>, ProofError>;

    /// Remembers a nonce handed out by a resource server
    async fn remember_nonce(&self, context: &NonceContext, nonce: &DPoPNonceRef);
}

/// Client credentials tokens for a single named client
pub struct ClientCredentialsTokenSource<C = System> {
    manager: Arc<ClientCredentialsTokenManager<C>>,
    client_name: ClientName,
    parameters: TokenRequestParameters,
}

impl<C> ClientCredentialsTokenSource<C> {
    /// Constructs a source requesting tokens with the given parameters
    pub fn new(
        manager: Arc<ClientCredentialsTokenManager<C>>,
        client_name: ClientName,
        parameters: TokenRequestParameters,
    ) -> Self {
        Self {
            manager,
            client_name,
            parameters,
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for ClientCredentialsTokenSource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentialsTokenSource")
            .field("client_name", &self.client_name)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C> AccessTokenSource for ClientCredentialsTokenSource<C>
where
    C: Clock + Send + Sync + 'static,
{
    type Token = ClientCredentialsToken;

    async fn access_token(
        &self,
        _: &http::Extensions,
        force_renewal: bool,
    ) -> std::result::Result<ClientCredentialsToken, TokenRequestError> {
        let mut parameters = self.parameters.clone();
        parameters.force_token_renewal |= force_renewal;
        self.manager
            .get_access_token(&self.client_name, &parameters)
            .await
    }

    async fn proof_token(
        &self,
        request: ProofRequest<'_>,
    ) -> std::result::Result<Option<ProofToken>, ProofError> {
        self.manager
            .client()
            .proof_service()
            .create_proof_token(request)
            .await
    }

    async fn remember_nonce(&self, context: &NonceContext, nonce: &DPoPNonceRef) {
        self.manager
            .client()
            .proof_service()
            .nonce_store()
            .store_nonce(context, nonce)
            .await;
    }
}

/// Tokens for the user identified by the [`Principal`] request extension
///
/// Requests without a principal are treated as anonymous and fail.
pub struct UserTokenSource<C = System> {
    manager: Arc<UserTokenManager<C>>,
    parameters: TokenRequestParameters,
}

impl<C> UserTokenSource<C> {
    /// Constructs a source requesting tokens with the given parameters
    pub fn new(manager: Arc<UserTokenManager<C>>, parameters: TokenRequestParameters) -> Self {
        Self {
            manager,
            parameters,
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for UserTokenSource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserTokenSource")
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C> AccessTokenSource for UserTokenSource<C>
where
    C: Clock + Send + Sync + 'static,
{
    type Token = UserToken;

    async fn access_token(
        &self,
        extensions: &http::Extensions,
        force_renewal: bool,
    ) -> std::result::Result<UserToken, TokenRequestError> {
        let anonymous = Principal::anonymous();
        let principal = extensions.get::<Principal>().unwrap_or(&anonymous);

        let mut parameters = self.parameters.clone();
        parameters.force_token_renewal |= force_renewal;
        self.manager.get_access_token(principal, &parameters).await
    }

    async fn proof_token(
        &self,
        request: ProofRequest<'_>,
    ) -> std::result::Result<Option<ProofToken>, ProofError> {
        self.manager
            .endpoint()
            .proof_service()
            .create_proof_token(request)
            .await
    }

    async fn remember_nonce(&self, context: &NonceContext, nonce: &DPoPNonceRef) {
        self.manager
            .endpoint()
            .proof_service()
            .nonce_store()
            .store_nonce(context, nonce)
            .await;
    }
}

/// A request extension forcing a renewed token for that request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForceTokenRenewal;

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<S, P = HttpsOnly> {
    source: S,
    predicate: P,
}

impl<S> AccessTokenMiddleware<S> {
    /// Construct a new middleware from a token source
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(source: S) -> Self {
        Self {
            source,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<S, P> {
        AccessTokenMiddleware {
            source: self.source,
            predicate,
        }
    }
}

enum Retry {
    Nonce(DPoPNonce),
    Renew,
}

fn authorization_value(scheme: &str, token: &str) -> Result<HeaderValue> {
    let mut header_value = BytesMut::with_capacity(scheme.len() + 1 + token.len());
    header_value.put_slice(scheme.as_bytes());
    header_value.put_u8(b' ');
    header_value.put_slice(token.as_bytes());
    let mut value = HeaderValue::from_maybe_shared(header_value.freeze()).map_err(Error::middleware)?;
    value.set_sensitive(true);
    Ok(value)
}

impl<S, P> AccessTokenMiddleware<S, P>
where
    S: AccessTokenSource,
{
    async fn token(&self, extensions: &http::Extensions, force: bool) -> Result<S::Token> {
        let token = self
            .source
            .access_token(extensions, force)
            .await
            .map_err(Error::middleware)?;

        tracing::trace!(
            token.scheme = token.scheme(),
            token.expiration = %token.expiration(),
            force,
            "obtained access token"
        );

        Ok(token)
    }

    async fn authorize(
        &self,
        req: &mut Request,
        token: &S::Token,
        nonce: Option<&DPoPNonceRef>,
    ) -> Result<()> {
        if token.uses_dpop() {
            let proof = self
                .source
                .proof_token(
                    ProofRequest::new(req.url(), req.method())
                        .with_key(token.dpop_key())
                        .with_nonce(nonce)
                        .with_access_token(Some(token.access_token())),
                )
                .await
                .map_err(Error::middleware)?;

            if let Some(proof) = proof {
                let mut value = HeaderValue::from_str(proof.as_str()).map_err(Error::middleware)?;
                value.set_sensitive(true);
                req.headers_mut()
                    .insert(HeaderName::from_static("dpop"), value);
            }
        }

        let value = authorization_value(token.scheme(), token.access_token().as_str())?;
        req.headers_mut().insert(header::AUTHORIZATION, value);
        Ok(())
    }
}

#[async_trait]
impl<S, P> Middleware for AccessTokenMiddleware<S, P>
where
    S: AccessTokenSource + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let force = extensions.get::<ForceTokenRenewal>().is_some();
        let mut token = self.token(extensions, force).await?;
        let mut nonce: Option<DPoPNonce> = None;
        let mut retry = dpop::SingleRetry::new();

        loop {
            let spare = req.try_clone();
            self.authorize(&mut req, &token, nonce.as_deref()).await?;

            let context = NonceContext::new(req.url(), req.method());
            let response = next.clone().run(req, extensions).await?;

            let issued_nonce = dpop::nonce_from_headers(response.headers());
            if let (true, Some(issued)) = (token.uses_dpop(), &issued_nonce) {
                self.source.remember_nonce(&context, issued).await;
            }

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            let Some(spare) = spare else {
                tracing::debug!("request cannot be cloned; not retrying");
                return Ok(response);
            };

            let reason = match issued_nonce {
                Some(issued) if token.uses_dpop() && dpop::is_nonce_challenge(response.headers()) => {
                    Retry::Nonce(issued)
                }
                _ => Retry::Renew,
            };

            match retry.permit(Some(reason)) {
                Some(Retry::Nonce(issued)) => {
                    tracing::debug!(nonce = %issued, "resource server demanded a DPoP nonce; retrying");
                    nonce = Some(issued);
                }
                Some(Retry::Renew) => {
                    tracing::debug!("access token was rejected; retrying with a renewed token");
                    token = self.token(extensions, true).await?;
                    nonce = None;
                }
                None => return Ok(response),
            }

            req = spare;
        }
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<no host>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}
