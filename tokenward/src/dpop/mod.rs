//! DPoP (RFC 9449) proof creation and nonce handling

use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use thiserror::Error;

use crate::{DPoPNonce, InvalidValue};

mod key;
mod nonce;
mod proof;
mod retry;

pub use key::{Curve, KeyError, ProofKey, PublicJwk};
pub use nonce::{CachedNonceStore, DPoPNonceStore, NonceContext, NonceStoreOptions};
pub use proof::{ProofRequest, ProofService};
pub use retry::{retry_with_nonce, SingleRetry};

/// The request header carrying a DPoP proof
pub const DPOP_HEADER: &str = "DPoP";

/// The response header carrying a server-issued nonce
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";

/// The error code a server uses to demand a nonce
pub const USE_DPOP_NONCE: &str = "use_dpop_nonce";

/// The error code a token endpoint uses to reject a proof
pub const INVALID_DPOP_PROOF: &str = "invalid_dpop_proof";

/// An error while creating a DPoP proof
#[derive(Debug, Error)]
pub enum ProofError {
    /// Unable to generate a unique proof identifier
    #[error("unable to generate proof identifier")]
    Random,
    /// Unable to sign the proof
    #[error("unable to sign proof")]
    Signing(#[from] aliri::error::JwtSigningError),
    /// The signed proof is not an acceptable value
    #[error("signed proof is invalid")]
    Invalid(#[from] InvalidValue),
}

/// Extracts a valid nonce from the `DPoP-Nonce` response header
pub fn nonce_from_headers(headers: &HeaderMap) -> Option<DPoPNonce> {
    let raw = headers.get(DPOP_NONCE_HEADER)?.to_str().ok()?;
    match DPoPNonce::new(raw.to_owned()) {
        Ok(nonce) => Some(nonce),
        Err(error) => {
            tracing::debug!(%error, "ignoring invalid DPoP nonce header");
            None
        }
    }
}

/// Whether a resource server's `WWW-Authenticate` challenge demands a DPoP nonce
pub fn is_nonce_challenge(headers: &HeaderMap) -> bool {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|challenge| {
            let challenge = challenge.trim_start();
            let (scheme, params) = challenge
                .split_once(char::is_whitespace)
                .unwrap_or((challenge, ""));

            scheme.eq_ignore_ascii_case("DPoP")
                && auth_params(params)
                    .any(|(name, value)| name.eq_ignore_ascii_case("error") && value == USE_DPOP_NONCE)
        })
}

fn auth_params(params: &str) -> impl Iterator<Item = (&str, &str)> {
    params.split(',').filter_map(|param| {
        let (name, value) = param.split_once('=')?;
        Some((name.trim(), value.trim().trim_matches('"')))
    })
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn challenge(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn dpop_nonce_challenges_are_recognised() {
        assert!(is_nonce_challenge(&challenge(
            r#"DPoP error="use_dpop_nonce", error_description="Resource server requires nonce in DPoP proof""#
        )));
        assert!(is_nonce_challenge(&challenge(r#"dpop algs="ES256", error=use_dpop_nonce"#)));
    }

    #[test]
    fn other_challenges_are_not_nonce_challenges() {
        assert!(!is_nonce_challenge(&challenge(r#"Bearer error="use_dpop_nonce""#)));
        assert!(!is_nonce_challenge(&challenge(r#"DPoP error="invalid_token""#)));
        assert!(!is_nonce_challenge(&challenge("DPoP")));
        assert!(!is_nonce_challenge(&HeaderMap::new()));
    }

    #[test]
    fn nonce_header_is_read() {
        let mut headers = HeaderMap::new();
        headers.insert(DPOP_NONCE_HEADER, HeaderValue::from_static("eyJ7S_zG.eyJH0-Z.HX4w-7v"));
        assert_eq!(
            nonce_from_headers(&headers),
            Some(DPoPNonce::from_static("eyJ7S_zG.eyJH0-Z.HX4w-7v"))
        );
        assert_eq!(nonce_from_headers(&HeaderMap::new()), None);
    }
}
