//! DTOs for interacting with OAuth2 token endpoints

use serde::Deserialize;
use tokenward_clock::{DurationSecs, UnixTime};

use crate::{
    dpop::ProofKey, AccessToken, AccessTokenType, ClientCredentialsToken, ClientIdRef,
    IdentityToken, InvalidValue, RefreshToken, Scope, UserToken,
};

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    /// A missing or zero lifetime means the token never expires
    pub(crate) fn expiration(&self, now: UnixTime) -> UnixTime {
        match self.expires_in {
            None | Some(0) => UnixTime::MAX,
            Some(secs) => now + DurationSecs(secs),
        }
    }

    pub(crate) fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    fn token_type(&self) -> Result<Option<AccessTokenType>, InvalidValue> {
        self.token_type.clone().map(AccessTokenType::new).transpose()
    }

    /// Servers sometimes echo an empty scope; that is treated as no scope
    fn scope(&self) -> Option<Scope> {
        self.scope.clone().and_then(|s| Scope::new(s).ok())
    }

    pub(crate) fn into_client_credentials_token(
        self,
        now: UnixTime,
        client_id: &ClientIdRef,
        dpop_key: Option<&ProofKey>,
    ) -> Result<ClientCredentialsToken, InvalidValue> {
        let mut token = ClientCredentialsToken::new(
            AccessToken::new(self.access_token.clone())?,
            self.expiration(now),
        )
        .with_client_id(client_id.to_owned());

        if let Some(token_type) = self.token_type()? {
            token = token.with_type(token_type);
        }
        if let Some(scope) = self.scope() {
            token = token.with_scope(scope);
        }
        if let Some(key) = dpop_key {
            token = token.with_dpop_key(key.clone());
        }

        Ok(token)
    }

    pub(crate) fn into_user_token(
        self,
        now: UnixTime,
        dpop_key: Option<&ProofKey>,
    ) -> Result<UserToken, InvalidValue> {
        let mut token = UserToken::new(
            AccessToken::new(self.access_token.clone())?,
            self.expiration(now),
        );

        if let Some(token_type) = self.token_type()? {
            token = token.with_type(token_type);
        }
        if let Some(scope) = self.scope() {
            token = token.with_scope(scope);
        }
        if let Some(key) = dpop_key {
            token = token.with_dpop_key(key.clone());
        }
        if let Some(refresh_token) = self.refresh_token {
            token = token.with_refresh_token(RefreshToken::new(refresh_token)?);
        }
        if let Some(id_token) = self.id_token {
            token = token.with_identity_token(IdentityToken::new(id_token)?);
        }

        Ok(token)
    }
}
