//! Access token lifecycle management for OAuth2 clients
//!
//! This crate obtains, caches, refreshes, and proves possession of access
//! tokens on behalf of a client application. It supports two flows:
//!
//! * **Client credentials**: a [`ClientCredentialsTokenManager`] requests
//!   tokens for named, machine-to-machine clients and caches them. Concurrent
//!   requests for the same client, scope, and resource are coalesced into a
//!   single request to the authority, cache lifetimes are learned from the
//!   tokens the authority issues, and failures are never cached.
//! * **Users**: a [`UserTokenManager`] keeps a signed-in user's access tokens
//!   fresh by redeeming the refresh token held in a [`UserTokenStore`](user::UserTokenStore).
//!
//! Either flow may bind tokens to a key using DPoP ([RFC 9449]). The
//! [`dpop`] module creates proofs and remembers the nonces servers hand out,
//! retrying a request once when a server demands a fresh nonce.
//!
//! Attaching tokens to outbound requests is handled by the companion
//! `tokenward_reqwest` crate.
//!
//! # Example
//!
//! ```no_run
//! use tokenward::{
//!     endpoint::{ClientCredentialsClient, ClientRegistry},
//!     ClientCredentialsTokenClient, ClientCredentialsTokenManagementOptions,
//!     ClientCredentialsTokenManager, ClientId, ClientName, ClientSecret, IssuedToken,
//!     TokenRequestParameters,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let clients = ClientRegistry::new().with_client(
//!     ClientName::from_static("catalog"),
//!     ClientCredentialsClient {
//!         token_endpoint: Some("https://issuer.example.com/connect/token".parse()?),
//!         client_id: Some(ClientId::from_static("catalog-service")),
//!         client_secret: Some(ClientSecret::from_static("s3cr3t")),
//!         ..ClientCredentialsClient::default()
//!     },
//! );
//!
//! let client = ClientCredentialsTokenClient::new(reqwest::Client::new(), clients);
//! let manager =
//!     ClientCredentialsTokenManager::new(client, ClientCredentialsTokenManagementOptions::default());
//!
//! let token = manager
//!     .get_access_token(&ClientName::from_static("catalog"), &TokenRequestParameters::new())
//!     .await?;
//! println!("{} expires at {}", token.scheme(), token.expiration());
//! # Ok(())
//! # }
//! ```
//!
//! [RFC 9449]: https://www.rfc-editor.org/rfc/rfc9449

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod braids;
pub mod cache;
pub mod dpop;
pub mod endpoint;
pub mod error;
mod manager;
mod tokens;
pub mod user;
mod validation;

#[cfg(test)]
mod test;

pub use tokenward_clock as clock;

pub use braids::*;
pub use endpoint::{ClientCredentialsTokenClient, UserTokenEndpoint};
pub use error::{BoxError, ConfigurationError, FailedResult, TokenRequestError};
pub use manager::{ClientCredentialsTokenManagementOptions, ClientCredentialsTokenManager};
pub use tokens::{
    ClientAssertion, ClientCredentialsToken, IssuedToken, TokenForParameters,
    TokenRequestParameters, UserToken,
};
pub use user::{Principal, UserTokenManager};
pub use validation::InvalidValue;
