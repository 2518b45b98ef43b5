//! Service user identity and bearer token material
//!
//! A provisioned cluster authenticates to the management server as a
//! service user derived from its namespace and name. Tokens for that user are
//! random strings over a consonant/digit alphabet, optionally stored hashed.

use std::collections::BTreeMap;

use aws_lc_rs::digest::{digest, Context, SHA256};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use data_encoding::{BASE32HEX_NOPAD, BASE32_NOPAD};

use crate::{Error, Result};

/// Label holding the user a token belongs to
pub const USER_ID_LABEL: &str = "authn.management.cattle.io/token-userId";
/// Label marking the kind of token
pub const TOKEN_KIND_LABEL: &str = "authn.management.cattle.io/kind";
/// Value of [`TOKEN_KIND_LABEL`] for provisioning tokens
pub const TOKEN_KIND_PROVISIONING: &str = "provisioning";
/// Annotation set on tokens whose secret is stored hashed
pub const TOKEN_HASHED_ANNOTATION: &str = "authn.management.cattle.io/token-hashed";
/// Value of the principal label on service users
pub const HASHED_PRINCIPAL_LABEL_VALUE: &str = "hashed-principal-name";
/// Auth provider recorded on minted tokens
pub const LOCAL_AUTH_PROVIDER: &str = "local";

const TOKEN_CHARSET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const TOKEN_LENGTH: usize = 54;
const SALT_LENGTH: usize = 8;
const HASH_VERSION: &str = "2";

/// A freshly minted bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
}

impl BearerToken {
    /// Generate a new random token
    ///
    /// Each character is drawn uniformly from the token alphabet by rejection
    /// sampling random bytes, so no character is favoured.
    pub fn generate() -> Result<Self> {
        let limit = 256 - (256 % TOKEN_CHARSET.len());
        let mut value = String::with_capacity(TOKEN_LENGTH);
        let mut buf = [0u8; TOKEN_LENGTH];

        while value.len() < TOKEN_LENGTH {
            aws_lc_rs::rand::fill(&mut buf)
                .map_err(|_| Error::credential("random generation failed"))?;
            for b in buf {
                if usize::from(b) >= limit {
                    continue;
                }
                value.push(char::from(TOKEN_CHARSET[usize::from(b) % TOKEN_CHARSET.len()]));
                if value.len() == TOKEN_LENGTH {
                    break;
                }
            }
        }

        Ok(Self { value })
    }

    /// Get the token as a string
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// The form stored on the token object: `$2:<salt>:<hash>`
    ///
    /// Salt and hash are unpadded standard base64; the hash is SHA-256 over
    /// the salt followed by the token.
    pub fn hashed(&self) -> Result<String> {
        let mut salt = [0u8; SALT_LENGTH];
        aws_lc_rs::rand::fill(&mut salt)
            .map_err(|_| Error::credential("random generation failed"))?;
        Ok(hash_with_salt(&self.value, &salt))
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken")
            .field("len", &self.value.len())
            .finish()
    }
}

fn hash_with_salt(token: &str, salt: &[u8]) -> String {
    let mut ctx = Context::new(&SHA256);
    ctx.update(salt);
    ctx.update(token.as_bytes());
    format!(
        "${HASH_VERSION}:{}:{}",
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(ctx.finish().as_ref())
    )
}

/// Check a cleartext token against a stored `$2:<salt>:<hash>` value
pub fn verify_hashed(token: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, ':');
    let (Some(version), Some(salt), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if version != format!("${HASH_VERSION}") {
        return false;
    }
    match STANDARD_NO_PAD.decode(salt) {
        Ok(salt) => hash_with_salt(token, &salt) == stored,
        Err(_) => false,
    }
}

/// Principal a cluster's service user authenticates as
pub fn principal_id(namespace: &str, name: &str) -> String {
    format!("system://provisioning/{namespace}/{name}")
}

/// Stable user name for a principal: `u-` plus ten base32 characters of its
/// SHA-256
pub fn user_name(principal: &str) -> String {
    let hash = digest(&SHA256, principal.as_bytes());
    let encoded = BASE32_NOPAD.encode(hash.as_ref());
    format!("u-{}", encoded[..10].to_lowercase())
}

/// Labels put on a service user so it can be found by principal
pub fn user_labels(principal: &str) -> BTreeMap<String, String> {
    let mut key = BASE32HEX_NOPAD.encode(principal.as_bytes());
    key.truncate(63);
    BTreeMap::from([(key, HASHED_PRINCIPAL_LABEL_VALUE.to_string())])
}

/// Labels put on a token minted for `user`
pub fn token_labels(user: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (USER_ID_LABEL.to_string(), user.to_string()),
        (TOKEN_KIND_LABEL.to_string(), TOKEN_KIND_PROVISIONING.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_use_the_alphabet() {
        let token = BearerToken::generate().expect("token");
        assert_eq!(token.as_str().len(), TOKEN_LENGTH);
        assert!(token.as_str().bytes().all(|b| TOKEN_CHARSET.contains(&b)));
    }

    #[test]
    fn generated_tokens_are_unique() {
        let a = BearerToken::generate().expect("token");
        let b = BearerToken::generate().expect("token");
        assert_ne!(a, b);
    }

    #[test]
    fn debug_does_not_expose_token() {
        let token = BearerToken::generate().expect("token");
        let debug = format!("{token:?}");
        assert!(!debug.contains(token.as_str()));
    }

    #[test]
    fn hashed_form_verifies_and_differs_from_cleartext() {
        let token = BearerToken::generate().expect("token");
        let stored = token.hashed().expect("hash");

        assert!(stored.starts_with("$2:"));
        assert_ne!(stored, token.as_str());
        assert!(verify_hashed(token.as_str(), &stored));
        assert!(!verify_hashed("wrong", &stored));
        assert!(!verify_hashed(token.as_str(), "plain"));
    }

    #[test]
    fn hash_uses_unpadded_base64_of_eight_byte_salt() {
        let stored = hash_with_salt("abc", &[0u8; 8]);
        let parts: Vec<_> = stored.split(':').collect();
        assert_eq!(parts[0], "$2");
        assert_eq!(parts[1], "AAAAAAAAAAA");
        assert!(!parts[2].ends_with('='));
    }

    #[test]
    fn principal_and_user_name_are_deterministic() {
        let principal = principal_id("ns1", "demo");
        assert_eq!(principal, "system://provisioning/ns1/demo");

        let name = user_name(&principal);
        assert_eq!(name, user_name(&principal));
        assert!(name.starts_with("u-"));
        assert_eq!(name.len(), 12);
        assert_eq!(name, name.to_lowercase());
        assert_ne!(name, user_name(&principal_id("ns1", "other")));
    }

    #[test]
    fn user_label_key_is_truncated_base32hex() {
        let labels = user_labels(&principal_id("a-long-namespace-name", "a-long-cluster-name"));
        let (key, value) = labels.iter().next().expect("label");
        assert_eq!(key.len(), 63);
        assert_eq!(value, HASHED_PRINCIPAL_LABEL_VALUE);
        assert!(key
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'V').contains(&b)));
    }

    #[test]
    fn token_labels_name_user_and_kind() {
        let labels = token_labels("u-abc");
        assert_eq!(labels[USER_ID_LABEL], "u-abc");
        assert_eq!(labels[TOKEN_KIND_LABEL], "provisioning");
    }
}
