use aliri_base64::Base64UrlRef;
use ring::digest;

use super::CacheKey;
use crate::{ClientNameRef, TokenRequestParameters};

/// Hashes a value for use as one segment of a cache key
///
/// Keeps arbitrary (and possibly sensitive) values out of cache keys while
/// preserving uniqueness.
pub(crate) fn hash_segment(value: &str) -> String {
    let digest = digest::digest(&digest::SHA256, value.as_bytes());
    Base64UrlRef::from_slice(digest.as_ref()).to_string()
}

/// Derives cache keys for client credentials tokens
///
/// Keys are unique per client name, scope, and resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCredentialsCacheKeyGenerator {
    prefix: String,
}

impl ClientCredentialsCacheKeyGenerator {
    /// Constructs a generator whose keys begin with `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Generates the cache key for a client and set of parameters
    pub fn generate_key(
        &self,
        client_name: &ClientNameRef,
        parameters: &TokenRequestParameters,
    ) -> CacheKey {
        let segment = |value: Option<&str>| value.map(hash_segment).unwrap_or_default();

        CacheKey::from(format!(
            "{}::{}::scope:{}::resource:{}",
            self.prefix,
            client_name,
            segment(parameters.scope().map(|s| s.as_str())),
            segment(parameters.resource().map(|r| r.as_str())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientName, Resource, Scope};

    fn generator() -> ClientCredentialsCacheKeyGenerator {
        ClientCredentialsCacheKeyGenerator::new("prefix")
    }

    #[test]
    fn keys_start_with_prefix_and_client() {
        let key = generator().generate_key(
            &ClientName::from_static("client"),
            &TokenRequestParameters::new(),
        );
        assert_eq!(key.as_str(), "prefix::client::scope:::resource:");
    }

    #[test]
    fn keys_differ_by_client_scope_and_resource() {
        let g = generator();
        let a = ClientName::from_static("a");
        let b = ClientName::from_static("b");
        let none = TokenRequestParameters::new();
        let scoped = TokenRequestParameters::new().with_scope(Scope::from_static("api1"));
        let other_scope = TokenRequestParameters::new().with_scope(Scope::from_static("api2"));
        let resource = TokenRequestParameters::new().with_resource(Resource::from_static("urn:api1"));

        let keys = [
            g.generate_key(&a, &none),
            g.generate_key(&b, &none),
            g.generate_key(&a, &scoped),
            g.generate_key(&a, &other_scope),
            g.generate_key(&a, &resource),
        ];

        for (i, left) in keys.iter().enumerate() {
            for right in &keys[i + 1..] {
                assert_ne!(left, right);
            }
        }
    }

    #[test]
    fn scope_and_resource_do_not_collide() {
        let g = generator();
        let name = ClientName::from_static("client");
        let scoped = TokenRequestParameters::new().with_scope(Scope::from_static("urn:x"));
        let resource = TokenRequestParameters::new().with_resource(Resource::from_static("urn:x"));
        assert_ne!(g.generate_key(&name, &scoped), g.generate_key(&name, &resource));
    }

    #[test]
    fn same_inputs_give_same_key() {
        let g = generator();
        let name = ClientName::from_static("client");
        let params = TokenRequestParameters::new()
            .with_scope(Scope::from_static("api1"))
            .with_parameter("audience", "ignored");
        assert_eq!(
            g.generate_key(&name, &params),
            g.generate_key(&name, &TokenRequestParameters::new().with_scope(Scope::from_static("api1")))
        );
    }

    #[test]
    fn hashed_segments_hide_raw_values() {
        let key = generator().generate_key(
            &ClientName::from_static("client"),
            &TokenRequestParameters::new().with_scope(Scope::from_static("secret-scope")),
        );
        assert!(!key.as_str().contains("secret-scope"));
    }
}
