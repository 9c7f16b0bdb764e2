use aliri_braid::braid;
use std::fmt;

use crate::validation::{validated, Rule};

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

const MAX_NAME_LENGTH: usize = 1024;
const MAX_TOKEN_LENGTH: usize = 32 * 1024;

/// The name under which a client's configuration is registered
#[braid(serde, validator)]
pub struct ClientName;

validated!(ClientName: "client name", [Rule::NonEmpty, Rule::MaxLength(MAX_NAME_LENGTH), Rule::NoControl]);

/// A client ID
#[braid(serde, validator)]
pub struct ClientId;

validated!(ClientId: "client ID", [Rule::NonEmpty, Rule::MaxLength(MAX_NAME_LENGTH), Rule::NoControl]);

/// A client secret
#[braid(serde, validator, debug = "owned", display = "owned")]
pub struct ClientSecret;

validated!(ClientSecret: "client secret", [Rule::NonEmpty, Rule::MaxLength(4096)]);

limited_reveal!(ClientSecretRef: "CLIENT SECRET", 5);

/// A space-delimited list of OAuth2 scopes
#[braid(serde, validator)]
pub struct Scope;

validated!(Scope: "scope", [Rule::NonEmpty, Rule::MaxLength(4096), Rule::NoControl]);

/// A resource indicator naming the protected resource a token is meant for
#[braid(serde, validator)]
pub struct Resource;

validated!(Resource: "resource", [Rule::NonEmpty, Rule::MaxLength(2048), Rule::VisibleAscii]);

/// An access token
#[braid(serde, validator, debug = "owned", display = "owned")]
pub struct AccessToken;

validated!(AccessToken: "access token", [Rule::NonEmpty, Rule::MaxLength(MAX_TOKEN_LENGTH), Rule::VisibleAscii]);

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// The type of an access token, such as `Bearer` or `DPoP`
#[braid(serde, validator)]
pub struct AccessTokenType;

validated!(AccessTokenType: "access token type", [Rule::NonEmpty, Rule::MaxLength(64), Rule::VisibleAscii]);

impl AccessTokenType {
    /// The `Bearer` token type
    #[inline]
    pub fn bearer() -> Self {
        Self::from_static("Bearer")
    }

    /// The `DPoP` token type
    #[inline]
    pub fn dpop() -> Self {
        Self::from_static("DPoP")
    }
}

impl AccessTokenTypeRef {
    /// Whether this is a proof-of-possession token type
    ///
    /// Token types are compared case-insensitively.
    #[inline]
    pub fn is_dpop(&self) -> bool {
        self.as_str().eq_ignore_ascii_case("DPoP")
    }
}

/// A refresh token
#[braid(serde, validator, debug = "owned", display = "owned")]
pub struct RefreshToken;

validated!(RefreshToken: "refresh token", [Rule::NonEmpty, Rule::MaxLength(MAX_TOKEN_LENGTH), Rule::VisibleAscii]);

limited_reveal!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// An OpenID Connect identity token
#[braid(serde, validator)]
pub struct IdentityToken;

validated!(IdentityToken: "identity token", [Rule::NonEmpty, Rule::MaxLength(MAX_TOKEN_LENGTH), Rule::VisibleAscii]);

/// A server-issued DPoP nonce
#[braid(serde, validator)]
pub struct DPoPNonce;

validated!(DPoPNonce: "DPoP nonce", [Rule::NonEmpty, Rule::MaxLength(4096), Rule::VisibleAscii]);

/// A signed DPoP proof, sent in the `DPoP` header
#[braid(serde, validator, debug = "owned", display = "owned")]
pub struct ProofToken;

validated!(ProofToken: "DPoP proof", [Rule::NonEmpty, Rule::MaxLength(MAX_TOKEN_LENGTH), Rule::VisibleAscii]);

limited_reveal!(ProofTokenRef: "DPoP PROOF", 15);

/// The type of a client assertion, such as
/// `urn:ietf:params:oauth:client-assertion-type:jwt-bearer`
#[braid(serde, validator)]
pub struct AssertionType;

validated!(AssertionType: "client assertion type", [Rule::NonEmpty, Rule::MaxLength(MAX_NAME_LENGTH), Rule::VisibleAscii]);

impl AssertionType {
    /// The JWT bearer assertion type from RFC 7523
    #[inline]
    pub fn jwt_bearer() -> Self {
        Self::from_static("urn:ietf:params:oauth:client-assertion-type:jwt-bearer")
    }
}

/// A signed client assertion, used in place of a client secret
#[braid(serde, validator, debug = "owned", display = "owned")]
pub struct Assertion;

validated!(Assertion: "client assertion", [Rule::NonEmpty, Rule::MaxLength(MAX_TOKEN_LENGTH), Rule::VisibleAscii]);

limited_reveal!(AssertionRef: "CLIENT ASSERTION", 15);

/// The stable identifier of an end user
#[braid(serde, validator)]
pub struct Subject;

validated!(Subject: "subject", [Rule::NonEmpty, Rule::MaxLength(MAX_NAME_LENGTH), Rule::NoControl]);
