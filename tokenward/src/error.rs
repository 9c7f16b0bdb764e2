//! Errors raised while acquiring, refreshing, or revoking tokens

use std::{error, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{dpop::ProofError, ClientName, InvalidValue};

/// The error type used by pluggable stores and providers
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// A protocol-level failure, as reported by an authority or by the token manager itself
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedResult {
    /// The OAuth2 error code
    pub error: String,

    /// A human-readable description of the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl FailedResult {
    /// No authenticated user was available
    pub const NO_ACTIVE_USER: &'static str = "no_active_user";
    /// The user has no stored token data
    pub const NO_TOKEN_DATA: &'static str = "no_token_data";

    /// Constructs a failure with just an error code
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: None,
        }
    }

    /// Adds a description to the failure
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }
}

impl fmt::Display for FailedResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.error)?;
        if let Some(description) = &self.error_description {
            write!(f, ": {}", description)?;
        }
        Ok(())
    }
}

impl error::Error for FailedResult {}

/// A client's configuration cannot be used to make the requested call
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No client was registered under the name
    #[error("no client registered under the name `{0}`")]
    UnknownClient(ClientName),
    /// The client has no token endpoint configured
    #[error("client `{0}` has no token endpoint")]
    MissingTokenEndpoint(String),
    /// The client has no client ID configured
    #[error("client `{0}` has no client ID")]
    MissingClientId(String),
    /// The client has neither a secret nor an assertion to authenticate with
    #[error("client `{0}` has neither a client secret nor a client assertion")]
    MissingClientCredentials(String),
    /// The client has no revocation endpoint configured
    #[error("client `{0}` has no revocation endpoint")]
    MissingRevocationEndpoint(String),
}

/// An error while attempting to request a token from the authority
///
/// This error is cheap to clone so that a single failed request can be
/// reported to every caller that was waiting on it.
#[derive(Clone, Debug, Error)]
pub enum TokenRequestError {
    /// The authority, or the token manager, refused to issue a token
    #[error("token request failed: {0}")]
    Rejected(FailedResult),
    /// An error from the authority that could not be interpreted as an OAuth2 error
    #[error("error requesting token from authority ({status}): {body}")]
    ErrorWithBody {
        /// The HTTP status code
        status: u16,
        /// The body of the error
        body: String,
    },
    /// The client configuration is incomplete
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] Arc<reqwest_middleware::Error>),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] Arc<reqwest::Error>),
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBody(#[source] Arc<serde_json::Error>),
    /// The authority returned a value that is not acceptable
    #[error("authority returned an invalid value")]
    InvalidResponse(#[from] InvalidValue),
    /// Unable to produce a DPoP proof for the request
    #[error("error creating DPoP proof")]
    Proof(#[source] Arc<ProofError>),
    /// The client assertion provider failed
    #[error("error obtaining client assertion")]
    Assertion(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The token store failed
    #[error("token store failure")]
    Store(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
}

impl TokenRequestError {
    /// The protocol-level failure, if this error represents one
    pub fn failed_result(&self) -> Option<&FailedResult> {
        match self {
            Self::Rejected(failed) => Some(failed),
            _ => None,
        }
    }

    pub(crate) fn rejected(error: &str) -> Self {
        Self::Rejected(FailedResult::new(error))
    }
}

impl From<FailedResult> for TokenRequestError {
    fn from(failed: FailedResult) -> Self {
        Self::Rejected(failed)
    }
}

impl From<ProofError> for TokenRequestError {
    fn from(err: ProofError) -> Self {
        Self::Proof(Arc::new(err))
    }
}

impl From<reqwest_middleware::Error> for TokenRequestError {
    fn from(err: reqwest_middleware::Error) -> Self {
        Self::RequestSend(Arc::new(err))
    }
}

impl From<serde_json::Error> for TokenRequestError {
    fn from(err: serde_json::Error) -> Self {
        Self::TokenBody(Arc::new(err))
    }
}
