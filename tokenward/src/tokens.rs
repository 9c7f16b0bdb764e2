use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokenward_clock::{DurationSecs, UnixTime};

use crate::{
    dpop::ProofKey, AccessToken, AccessTokenRef, AccessTokenType, AccessTokenTypeRef, Assertion,
    AssertionType, ClientId, ClientIdRef, IdentityToken, IdentityTokenRef, RefreshToken,
    RefreshTokenRef, Resource, ResourceRef, Scope, ScopeRef,
};

/// The parts of an issued token needed to present it to a resource server
pub trait IssuedToken {
    /// The access token
    fn access_token(&self) -> &AccessTokenRef;

    /// The token type reported by the authority
    fn access_token_type(&self) -> Option<&AccessTokenTypeRef>;

    /// The proof key the token is bound to, if any
    fn dpop_key(&self) -> Option<&ProofKey>;

    /// The time at which the token expires
    fn expiration(&self) -> UnixTime;

    /// Whether requests using this token must carry a DPoP proof
    fn uses_dpop(&self) -> bool {
        self.dpop_key().is_some() && self.access_token_type().map_or(false, |t| t.is_dpop())
    }

    /// The HTTP authorization scheme for this token
    fn scheme(&self) -> &'static str {
        if self.uses_dpop() {
            "DPoP"
        } else {
            "Bearer"
        }
    }

    /// Whether the token is expired, or will be within `buffer`, as of `now`
    fn expires_within(&self, buffer: DurationSecs, now: UnixTime) -> bool {
        self.expiration() - buffer < now
    }
}

/// An access token obtained through the client credentials flow
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentialsToken {
    access_token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token_type: Option<AccessTokenType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dpop_key: Option<ProofKey>,
    expiration: UnixTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<ClientId>,
}

impl ClientCredentialsToken {
    /// Constructs a token which expires at `expiration`
    pub fn new(access_token: AccessToken, expiration: UnixTime) -> Self {
        Self {
            access_token,
            access_token_type: None,
            dpop_key: None,
            expiration,
            scope: None,
            client_id: None,
        }
    }

    /// Sets the token type
    pub fn with_type(mut self, access_token_type: AccessTokenType) -> Self {
        self.access_token_type = Some(access_token_type);
        self
    }

    /// Binds the token to a proof key
    pub fn with_dpop_key(mut self, dpop_key: ProofKey) -> Self {
        self.dpop_key = Some(dpop_key);
        self
    }

    /// Records the scope the token was issued for
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Records the client the token was issued to
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Gets the scope the token was issued for
    #[inline]
    pub fn scope(&self) -> Option<&ScopeRef> {
        self.scope.as_deref()
    }

    /// Gets the client the token was issued to
    #[inline]
    pub fn client_id(&self) -> Option<&ClientIdRef> {
        self.client_id.as_deref()
    }
}

impl IssuedToken for ClientCredentialsToken {
    #[inline]
    fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    #[inline]
    fn access_token_type(&self) -> Option<&AccessTokenTypeRef> {
        self.access_token_type.as_deref()
    }

    #[inline]
    fn dpop_key(&self) -> Option<&ProofKey> {
        self.dpop_key.as_ref()
    }

    #[inline]
    fn expiration(&self) -> UnixTime {
        self.expiration
    }
}

/// An access token issued on behalf of an end user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserToken {
    #[serde(flatten)]
    token: ClientCredentialsToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity_token: Option<IdentityToken>,
}

impl UserToken {
    /// Constructs a user token which expires at `expiration`
    pub fn new(access_token: AccessToken, expiration: UnixTime) -> Self {
        Self {
            token: ClientCredentialsToken::new(access_token, expiration),
            refresh_token: None,
            identity_token: None,
        }
    }

    /// Sets the token type
    pub fn with_type(mut self, access_token_type: AccessTokenType) -> Self {
        self.token = self.token.with_type(access_token_type);
        self
    }

    /// Binds the token to a proof key
    pub fn with_dpop_key(mut self, dpop_key: ProofKey) -> Self {
        self.token = self.token.with_dpop_key(dpop_key);
        self
    }

    /// Records the scope the token was issued for
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.token = self.token.with_scope(scope);
        self
    }

    /// Attaches the refresh token that can renew this token
    pub fn with_refresh_token(mut self, refresh_token: RefreshToken) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    /// Attaches the identity token issued alongside this token
    pub fn with_identity_token(mut self, identity_token: IdentityToken) -> Self {
        self.identity_token = Some(identity_token);
        self
    }

    /// Gets the scope the token was issued for
    #[inline]
    pub fn scope(&self) -> Option<&ScopeRef> {
        self.token.scope()
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Gets the identity token
    #[inline]
    pub fn identity_token(&self) -> Option<&IdentityTokenRef> {
        self.identity_token.as_deref()
    }
}

impl IssuedToken for UserToken {
    #[inline]
    fn access_token(&self) -> &AccessTokenRef {
        self.token.access_token()
    }

    #[inline]
    fn access_token_type(&self) -> Option<&AccessTokenTypeRef> {
        self.token.access_token_type()
    }

    #[inline]
    fn dpop_key(&self) -> Option<&ProofKey> {
        self.token.dpop_key()
    }

    #[inline]
    fn expiration(&self) -> UnixTime {
        self.token.expiration()
    }
}

/// What a user token store holds for a given user and set of parameters
///
/// A store may know the user's refresh token without holding an access token
/// for the requested resource yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenForParameters {
    /// The stored access token, if any
    pub token: Option<UserToken>,
    /// The stored refresh token, if any
    pub refresh_token: Option<RefreshToken>,
}

impl TokenForParameters {
    /// The refresh token to redeem or revoke
    ///
    /// Prefers the separately stored refresh token, falling back to the one
    /// issued alongside the stored access token.
    pub fn usable_refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token
            .as_deref()
            .or_else(|| self.token.as_ref().and_then(UserToken::refresh_token))
    }
}

/// A client assertion, used to authenticate a client in place of a secret
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAssertion {
    /// The assertion type
    #[serde(rename = "type")]
    pub assertion_type: AssertionType,
    /// The signed assertion
    pub value: Assertion,
}

/// Per-call options for a token request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenRequestParameters {
    /// Overrides the client's configured scope
    pub scope: Option<Scope>,
    /// Overrides the client's configured resource
    pub resource: Option<Resource>,
    /// Additional form parameters sent to the token endpoint
    pub parameters: BTreeMap<String, String>,
    /// A client assertion to use instead of the client's secret
    pub assertion: Option<ClientAssertion>,
    /// Skip the cache and request a new token
    pub force_token_renewal: bool,
}

impl TokenRequestParameters {
    /// Constructs an empty set of parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a specific scope
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Requests a token for a specific resource
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Adds a form parameter to the token request
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Authenticates the request with an assertion
    pub fn with_assertion(mut self, assertion: ClientAssertion) -> Self {
        self.assertion = Some(assertion);
        self
    }

    /// Skips the cache for this request
    pub fn force_renewal(mut self) -> Self {
        self.force_token_renewal = true;
        self
    }

    /// Gets the requested scope
    #[inline]
    pub fn scope(&self) -> Option<&ScopeRef> {
        self.scope.as_deref()
    }

    /// Gets the requested resource
    #[inline]
    pub fn resource(&self) -> Option<&ResourceRef> {
        self.resource.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn token(expiration: u64) -> ClientCredentialsToken {
        ClientCredentialsToken::new(AccessToken::from_static("token1"), UnixTime(expiration))
    }

    #[test]
    fn bearer_is_the_default_scheme() {
        assert_eq!(token(100).scheme(), "Bearer");
        assert!(!token(100).uses_dpop());
    }

    #[test]
    fn dpop_scheme_needs_both_type_and_key() {
        let typed = token(100).with_type(AccessTokenType::dpop());
        assert_eq!(typed.scheme(), "Bearer");

        let keyed = token(100).with_dpop_key(test::ec_p256_key());
        assert_eq!(keyed.scheme(), "Bearer");

        let bound = keyed.with_type(AccessTokenType::dpop());
        assert_eq!(bound.scheme(), "DPoP");
    }

    #[test]
    fn expiry_honours_buffer() {
        let t = token(1_000);
        assert!(!t.expires_within(DurationSecs(60), UnixTime(900)));
        assert!(t.expires_within(DurationSecs(60), UnixTime(941)));
        assert!(!token(u64::MAX).expires_within(DurationSecs(60), UnixTime(u64::MAX - 1)));
    }

    #[test]
    fn user_tokens_serialize_flat() {
        let t = UserToken::new(AccessToken::from_static("token1"), UnixTime(100))
            .with_refresh_token(RefreshToken::from_static("refresh1"));
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["access_token"], "token1");
        assert_eq!(json["refresh_token"], "refresh1");
        assert_eq!(json["expiration"], 100);

        let back: UserToken = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }
}
