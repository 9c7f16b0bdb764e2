use std::{fmt, sync::Arc};

use aliri::{jwa, jwt::HasAlgorithm, Jwt};
use aliri_base64::Base64UrlRef;
use reqwest::{Method, Url};
use ring::{
    digest,
    rand::{SecureRandom, SystemRandom},
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokenward_clock::{Clock, System};

use super::{
    nonce::target_uri, CachedNonceStore, DPoPNonceStore, NonceContext, ProofError, ProofKey,
    PublicJwk,
};
use crate::{AccessTokenRef, DPoPNonceRef, ProofToken};

const DPOP_JWT_TYPE: &str = "dpop+jwt";
const RESERVED_CLAIMS: [&str; 6] = ["jti", "htm", "htu", "iat", "nonce", "ath"];

/// The inputs for a single DPoP proof
#[derive(Clone, Copy, Debug)]
pub struct ProofRequest<'a> {
    url: &'a Url,
    method: &'a Method,
    proof_key: Option<&'a ProofKey>,
    nonce: Option<&'a DPoPNonceRef>,
    access_token: Option<&'a AccessTokenRef>,
    additional_claims: Option<&'a Map<String, Value>>,
}

impl<'a> ProofRequest<'a> {
    /// Describes a proof for a request to `url` using `method`
    pub fn new(url: &'a Url, method: &'a Method) -> Self {
        Self {
            url,
            method,
            proof_key: None,
            nonce: None,
            access_token: None,
            additional_claims: None,
        }
    }

    /// Sets the key to sign with; without one, no proof is produced
    pub fn with_key(mut self, proof_key: Option<&'a ProofKey>) -> Self {
        self.proof_key = proof_key;
        self
    }

    /// Sets a server-issued nonce, which is also remembered for the request target
    pub fn with_nonce(mut self, nonce: Option<&'a DPoPNonceRef>) -> Self {
        self.nonce = nonce;
        self
    }

    /// Binds the proof to an access token
    pub fn with_access_token(mut self, access_token: Option<&'a AccessTokenRef>) -> Self {
        self.access_token = access_token;
        self
    }

    /// Adds claims to the proof; these never replace the standard DPoP claims
    pub fn with_additional_claims(mut self, claims: Option<&'a Map<String, Value>>) -> Self {
        self.additional_claims = claims;
        self
    }
}

#[derive(Serialize)]
struct ProofHeader<'a> {
    typ: &'static str,
    alg: jwa::Algorithm,
    jwk: &'a PublicJwk,
}

impl HasAlgorithm for ProofHeader<'_> {
    #[inline]
    fn alg(&self) -> jwa::Algorithm {
        self.alg
    }
}

/// Creates signed DPoP proofs
///
/// Nonces supplied with a request are remembered in the nonce store, and
/// requests made without one use the last nonce remembered for the same
/// target.
pub struct ProofService<C = System> {
    nonces: Arc<dyn DPoPNonceStore>,
    clock: C,
    rng: SystemRandom,
}

impl ProofService {
    /// Constructs a proof service using the system clock
    pub fn new(nonces: Arc<dyn DPoPNonceStore>) -> Self {
        Self::with_clock(nonces, System)
    }
}

impl Default for ProofService {
    /// A proof service which remembers nonces in process memory
    fn default() -> Self {
        Self::new(Arc::new(CachedNonceStore::in_memory()))
    }
}

impl<C> ProofService<C> {
    /// Constructs a proof service using the provided clock
    pub fn with_clock(nonces: Arc<dyn DPoPNonceStore>, clock: C) -> Self {
        Self {
            nonces,
            clock,
            rng: SystemRandom::new(),
        }
    }

    /// The store in which nonces are remembered
    #[inline]
    pub fn nonce_store(&self) -> &Arc<dyn DPoPNonceStore> {
        &self.nonces
    }

    /// The thumbprint of a proof key, if one is provided
    #[inline]
    pub fn proof_key_thumbprint<'k>(&self, proof_key: Option<&'k ProofKey>) -> Option<&'k str> {
        proof_key.map(ProofKey::thumbprint)
    }
}

impl<C: fmt::Debug> fmt::Debug for ProofService<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProofService")
            .field("nonces", &self.nonces)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<C: Clock> ProofService<C> {
    /// Creates a proof for the request, or `None` if no proof key was provided
    #[tracing::instrument(
        level = "trace",
        err,
        skip(self, request),
        fields(htm = %request.method, htu = %request.url),
    )]
    pub async fn create_proof_token(
        &self,
        request: ProofRequest<'_>,
    ) -> Result<Option<ProofToken>, ProofError> {
        let Some(key) = request.proof_key else {
            return Ok(None);
        };

        let context = NonceContext::new(request.url, request.method);
        let nonce = match request.nonce {
            Some(nonce) => {
                self.nonces.store_nonce(&context, nonce).await;
                Some(nonce.to_owned())
            }
            None => self.nonces.get_nonce(&context).await,
        };

        let mut jti = [0u8; 16];
        self.rng.fill(&mut jti).map_err(|_| ProofError::Random)?;

        let mut claims = request.additional_claims.cloned().unwrap_or_default();
        for reserved in RESERVED_CLAIMS {
            claims.remove(reserved);
        }

        claims.insert("jti".into(), Base64UrlRef::from_slice(&jti).to_string().into());
        claims.insert("htm".into(), context.method().into());
        claims.insert("htu".into(), target_uri(request.url).into());
        claims.insert("iat".into(), self.clock.now().0.into());
        if let Some(nonce) = &nonce {
            claims.insert("nonce".into(), nonce.as_str().into());
        }
        if let Some(access_token) = request.access_token {
            claims.insert("ath".into(), access_token_hash(access_token).into());
        }

        let header = ProofHeader {
            typ: DPOP_JWT_TYPE,
            alg: key.algorithm(),
            jwk: key.public_jwk(),
        };
        let proof = Jwt::try_from_parts_with_signature(&header, &claims, key.jwk())?;

        tracing::trace!(has_nonce = nonce.is_some(), "created DPoP proof");

        Ok(Some(ProofToken::new(proof.as_str().to_owned())?))
    }
}

/// The `ath` claim: the base64url-encoded SHA-256 hash of the access token
pub(crate) fn access_token_hash(access_token: &AccessTokenRef) -> String {
    let digest = digest::digest(&digest::SHA256, access_token.as_str().as_bytes());
    Base64UrlRef::from_slice(digest.as_ref()).to_string()
}
