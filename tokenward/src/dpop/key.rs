//! Private keys used to sign DPoP proofs

use std::{fmt, str::FromStr, sync::Arc};

use aliri::{jwa, jws::Signer as _, Jwk};
use aliri_base64::Base64UrlRef;
use ring::digest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// An error while loading a proof key
#[derive(Debug, Error)]
pub enum KeyError {
    /// The key is not a well-formed JSON web key
    #[error("malformed JSON web key")]
    Malformed(#[from] serde_json::Error),
    /// A required member of the key is missing
    #[error("JSON web key is missing the `{0}` member")]
    MissingComponent(&'static str),
    /// The key type is not supported
    #[error("unsupported key type `{0}`")]
    UnsupportedKeyType(String),
    /// The elliptic curve is not supported
    #[error("unsupported elliptic curve `{0}`")]
    UnsupportedCurve(String),
    /// The signing algorithm is not supported
    #[error("unsupported signing algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    /// The signing algorithm cannot be used with the key
    #[error("signing algorithm {algorithm} cannot be used with this key")]
    IncompatibleAlgorithm {
        /// The requested algorithm
        algorithm: jwa::Algorithm,
    },
    /// The key material was rejected
    #[error("key material rejected")]
    Rejected(#[source] serde_json::Error),
}

/// Supported elliptic curves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Curve {
    /// NIST P-256
    #[serde(rename = "P-256")]
    P256,
    /// NIST P-384
    #[serde(rename = "P-384")]
    P384,
}

impl Curve {
    fn as_str(self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
        }
    }
}

/// The public half of a proof key, as embedded in a DPoP proof header
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kty")]
pub enum PublicJwk {
    /// An RSA public key
    #[serde(rename = "RSA")]
    Rsa {
        /// The modulus, base64url-encoded
        n: String,
        /// The public exponent, base64url-encoded
        e: String,
    },
    /// An elliptic curve public key
    #[serde(rename = "EC")]
    Ec {
        /// The curve
        crv: Curve,
        /// The x coordinate, base64url-encoded
        x: String,
        /// The y coordinate, base64url-encoded
        y: String,
    },
}

impl PublicJwk {
    fn from_members(source: &Map<String, Value>) -> Result<Self, KeyError> {
        match member(source, "kty")? {
            "RSA" => Ok(Self::Rsa {
                n: member(source, "n")?.to_owned(),
                e: member(source, "e")?.to_owned(),
            }),
            "EC" => {
                let crv = match member(source, "crv")? {
                    "P-256" => Curve::P256,
                    "P-384" => Curve::P384,
                    other => return Err(KeyError::UnsupportedCurve(other.to_owned())),
                };
                Ok(Self::Ec {
                    crv,
                    x: member(source, "x")?.to_owned(),
                    y: member(source, "y")?.to_owned(),
                })
            }
            other => Err(KeyError::UnsupportedKeyType(other.to_owned())),
        }
    }

    /// The algorithm used when the key does not name one
    fn default_algorithm(&self) -> jwa::Algorithm {
        match self {
            Self::Rsa { .. } => jwa::Algorithm::PS256,
            Self::Ec {
                crv: Curve::P256, ..
            } => jwa::Algorithm::ES256,
            Self::Ec {
                crv: Curve::P384, ..
            } => jwa::Algorithm::ES384,
        }
    }

    /// Computes the JWK thumbprint defined in RFC 7638
    ///
    /// The thumbprint is the base64url-encoded SHA-256 digest of the
    /// required members of the key, in lexicographic order and without
    /// whitespace.
    pub fn thumbprint(&self) -> String {
        let canonical = match self {
            Self::Rsa { n, e } => format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n),
            Self::Ec { crv, x, y } => format!(
                r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                crv.as_str(),
                x,
                y
            ),
        };

        Base64UrlRef::from_slice(digest::digest(&digest::SHA256, canonical.as_bytes()).as_ref())
            .to_string()
    }
}

fn member<'a>(source: &'a Map<String, Value>, name: &'static str) -> Result<&'a str, KeyError> {
    source
        .get(name)
        .and_then(Value::as_str)
        .ok_or(KeyError::MissingComponent(name))
}

struct KeyInner {
    source: Map<String, Value>,
    jwk: Jwk,
    public: PublicJwk,
    algorithm: jwa::Algorithm,
    key_id: Option<String>,
    thumbprint: String,
}

/// A private JSON web key used to sign DPoP proofs
///
/// Supports RSA keys and elliptic curve keys on P-256 or P-384. If the key
/// does not name an algorithm, RSA keys sign with PS256 and elliptic curve
/// keys with the algorithm matching their curve.
///
/// Cloning a key is cheap. Formatting a key never reveals private material.
#[derive(Clone)]
pub struct ProofKey {
    inner: Arc<KeyInner>,
}

impl ProofKey {
    /// Parses a private key from its JSON web key representation
    pub fn from_jwk(jwk: &str) -> Result<Self, KeyError> {
        let source: Map<String, Value> = serde_json::from_str(jwk)?;
        Self::from_map(source)
    }

    fn from_map(source: Map<String, Value>) -> Result<Self, KeyError> {
        let public = PublicJwk::from_members(&source)?;
        member(&source, "d")?;

        let algorithm = match source.get("alg") {
            Some(alg) => serde_json::from_value::<jwa::Algorithm>(alg.clone()).map_err(|_| {
                KeyError::UnsupportedAlgorithm(alg.as_str().unwrap_or_default().to_owned())
            })?,
            None => public.default_algorithm(),
        };

        // The requested algorithm is checked here so that a mismatch is
        // reported as such rather than as rejected key material
        let mut material = source.clone();
        material.remove("alg");
        let jwk: Jwk =
            serde_json::from_value(Value::Object(material)).map_err(KeyError::Rejected)?;
        if !jwk.can_sign(algorithm) {
            return Err(KeyError::IncompatibleAlgorithm { algorithm });
        }

        let key_id = member(&source, "kid").ok().map(ToOwned::to_owned);
        let thumbprint = public.thumbprint();

        Ok(Self {
            inner: Arc::new(KeyInner {
                jwk: jwk.with_algorithm(algorithm),
                source,
                public,
                algorithm,
                key_id,
                thumbprint,
            }),
        })
    }

    /// The algorithm used to sign with this key
    #[inline]
    pub fn algorithm(&self) -> jwa::Algorithm {
        self.inner.algorithm
    }

    /// The public half of this key
    #[inline]
    pub fn public_jwk(&self) -> &PublicJwk {
        &self.inner.public
    }

    /// The key ID, if the key declared one
    #[inline]
    pub fn key_id(&self) -> Option<&str> {
        self.inner.key_id.as_deref()
    }

    /// The RFC 7638 thumbprint of this key
    #[inline]
    pub fn thumbprint(&self) -> &str {
        &self.inner.thumbprint
    }

    /// The signing key, restricted to [`algorithm()`][Self::algorithm()]
    #[inline]
    pub(crate) fn jwk(&self) -> &Jwk {
        &self.inner.jwk
    }
}

impl FromStr for ProofKey {
    type Err = KeyError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_jwk(s)
    }
}

impl PartialEq for ProofKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.thumbprint == other.inner.thumbprint
            && self.inner.algorithm == other.inner.algorithm
    }
}

impl Eq for ProofKey {}

impl fmt::Debug for ProofKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProofKey")
            .field("alg", &self.inner.algorithm)
            .field("kid", &self.inner.key_id)
            .field("thumbprint", &self.inner.thumbprint)
            .finish_non_exhaustive()
    }
}

impl Serialize for ProofKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.source.serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JwkRepr {
    Text(String),
    Object(Map<String, Value>),
}

impl<'de> Deserialize<'de> for ProofKey {
    /// Accepts either a JSON web key object or a string containing one
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = match JwkRepr::deserialize(deserializer)? {
            JwkRepr::Text(text) => Self::from_jwk(&text),
            JwkRepr::Object(map) => Self::from_map(map),
        };
        key.map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use aliri::jws::{Signer as _, Verifier as _};

    use super::*;
    use crate::test;

    #[test]
    fn ec_keys_default_to_curve_algorithm() {
        assert_eq!(test::ec_p256_key().algorithm(), jwa::Algorithm::ES256);
        assert_eq!(test::ec_p384_key().algorithm(), jwa::Algorithm::ES384);
    }

    #[test]
    fn rsa_keys_default_to_pss() {
        assert_eq!(test::rsa_key().algorithm(), jwa::Algorithm::PS256);
    }

    #[test]
    fn thumbprints_follow_rfc7638() {
        assert_eq!(
            test::ec_p256_key().thumbprint(),
            "qpRf85GMb-XVjQPVIU5eahv8qx0bk3ZFlo4ui-45OuE"
        );
        assert_eq!(
            test::ec_p384_key().thumbprint(),
            "RGYAftvkIEpfoQFqfdci1DAom-OGy5wRRFkGhaa-g0U"
        );
        assert_eq!(
            test::rsa_key().thumbprint(),
            "-9vPMDF1FHFwoJQAueTAMJMDojkra34uj_LmyTgRqzw"
        );
    }

    #[test]
    fn public_jwk_omits_private_members() {
        let public = serde_json::to_value(test::ec_p256_key().public_jwk()).unwrap();
        let expected: serde_json::Value =
            serde_json::from_str(include_str!("../../data/ec-p256-public.json")).unwrap();
        assert_eq!(public, expected);
    }

    #[test]
    fn signatures_verify_with_the_same_key() {
        for key in [test::ec_p256_key(), test::ec_p384_key(), test::rsa_key()] {
            let sig = key.jwk().sign(key.algorithm(), b"message").unwrap();
            key.jwk().verify(key.algorithm(), b"message", &sig).unwrap();
            assert!(key.jwk().verify(key.algorithm(), b"massage", &sig).is_err());
        }
    }

    #[test]
    fn explicit_algorithm_is_honoured() {
        let mut jwk: serde_json::Value =
            serde_json::from_str(include_str!("../../data/rsa.json")).unwrap();
        jwk["alg"] = "RS384".into();
        let key = ProofKey::from_jwk(&jwk.to_string()).unwrap();
        assert_eq!(key.algorithm(), jwa::Algorithm::RS384);
    }

    #[test]
    fn mismatched_curve_algorithm_is_rejected() {
        let mut jwk: serde_json::Value =
            serde_json::from_str(include_str!("../../data/ec-p256.json")).unwrap();
        jwk["alg"] = "ES384".into();
        assert!(matches!(
            ProofKey::from_jwk(&jwk.to_string()),
            Err(KeyError::IncompatibleAlgorithm {
                algorithm: jwa::Algorithm::ES384
            })
        ));
    }

    #[test]
    fn unknown_algorithms_are_unsupported() {
        let mut jwk: serde_json::Value =
            serde_json::from_str(include_str!("../../data/ec-p256.json")).unwrap();
        jwk["alg"] = "EdDSA".into();
        assert!(matches!(
            ProofKey::from_jwk(&jwk.to_string()),
            Err(KeyError::UnsupportedAlgorithm(alg)) if alg == "EdDSA"
        ));
    }

    #[test]
    fn public_keys_cannot_sign() {
        assert!(matches!(
            ProofKey::from_jwk(include_str!("../../data/ec-p256-public.json")),
            Err(KeyError::MissingComponent("d"))
        ));
    }

    #[test]
    fn symmetric_keys_are_unsupported() {
        assert!(matches!(
            ProofKey::from_jwk(r#"{"kty":"oct","k":"c2VjcmV0"}"#),
            Err(KeyError::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn unsupported_curves_are_rejected_before_loading() {
        assert!(matches!(
            ProofKey::from_jwk(r#"{"kty":"EC","crv":"P-521","x":"AA","y":"AA","d":"AA"}"#),
            Err(KeyError::UnsupportedCurve(crv)) if crv == "P-521"
        ));
    }

    #[test]
    fn debug_output_hides_private_material() {
        let rendered = format!("{:?}", test::ec_p256_key());
        assert!(rendered.contains("qpRf85GMb"));
        assert!(!rendered.contains("im89oggN"));
    }

    #[test]
    fn keys_deserialize_from_strings_and_objects() {
        let text = include_str!("../../data/ec-p256.json");
        let from_object: ProofKey = serde_json::from_str(text).unwrap();
        let from_string: ProofKey =
            serde_json::from_value(serde_json::Value::String(text.to_owned())).unwrap();
        assert_eq!(from_object, from_string);

        let round_tripped: ProofKey =
            serde_json::from_value(serde_json::to_value(&from_object).unwrap()).unwrap();
        assert_eq!(round_tripped.thumbprint(), from_object.thumbprint());
    }
}
