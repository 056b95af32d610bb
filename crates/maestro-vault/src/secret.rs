//! Secret value wrappers.
//!
//! [`Secret`] holds a sensitive string (token, key, password) and keeps it
//! out of logs: `Debug` and `Display` print `[REDACTED]`, and the backing
//! memory is zeroed on drop.  The inner value is only reachable through
//! [`Secret::expose`].
//!
//! [`SecretPayload`] is the typed plaintext form of a credential record —
//! what the vault encrypts on `put` and hands back from `get`.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret string that prevents accidental exposure in logs and zeroes its
/// memory on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.  Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The kind of credential stored in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// OAuth2 access/refresh token pair.
    OAuth,
    /// Static API key or bearer token.
    ApiKey,
    /// Username/password pair for basic authentication.
    Basic,
}

impl CredentialKind {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OAuth => "oauth",
            Self::ApiKey => "api_key",
            Self::Basic => "basic",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oauth" => Some(Self::OAuth),
            "api_key" => Some(Self::ApiKey),
            "basic" => Some(Self::Basic),
            _ => None,
        }
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decrypted plaintext of a credential record.
///
/// Serialized to JSON before encryption; only ever materialized in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretPayload {
    /// OAuth2 token pair as returned by a token endpoint.
    OAuth {
        access_token: Secret,
        refresh_token: Option<Secret>,
        token_type: String,
    },
    /// Static API key.
    ApiKey { key: Secret },
    /// Basic-auth pair.
    Basic { username: String, password: Secret },
}

impl SecretPayload {
    /// The credential kind this payload corresponds to.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::OAuth { .. } => CredentialKind::OAuth,
            Self::ApiKey { .. } => CredentialKind::ApiKey,
            Self::Basic { .. } => CredentialKind::Basic,
        }
    }

    /// The secret a consumer would present to the provider: the access token
    /// for OAuth records, the key for API-key records, the password for
    /// basic-auth records.
    pub fn bearer_secret(&self) -> &Secret {
        match self {
            Self::OAuth { access_token, .. } => access_token,
            Self::ApiKey { key } => key,
            Self::Basic { password, .. } => password,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("sk-very-secret");
        assert_eq!(format!("{secret:?}"), "Secret([REDACTED])");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn secret_expose_returns_value() {
        let secret = Secret::new("token-123");
        assert_eq!(secret.expose(), "token-123");
    }

    #[test]
    fn payload_kind_matches_variant() {
        let oauth = SecretPayload::OAuth {
            access_token: Secret::new("a"),
            refresh_token: None,
            token_type: "Bearer".into(),
        };
        assert_eq!(oauth.kind(), CredentialKind::OAuth);

        let api = SecretPayload::ApiKey {
            key: Secret::new("k"),
        };
        assert_eq!(api.kind(), CredentialKind::ApiKey);

        let basic = SecretPayload::Basic {
            username: "u".into(),
            password: Secret::new("p"),
        };
        assert_eq!(basic.kind(), CredentialKind::Basic);
    }

    #[test]
    fn payload_roundtrips_through_json() {
        let payload = SecretPayload::OAuth {
            access_token: Secret::new("acc"),
            refresh_token: Some(Secret::new("ref")),
            token_type: "Bearer".into(),
        };

        let json = serde_json::to_string(&payload).unwrap();
        // The serialized form necessarily contains the secret; it is only
        // ever produced en route to the cipher.
        assert!(json.contains("acc"));

        let back: SecretPayload = serde_json::from_str(&json).unwrap();
        match back {
            SecretPayload::OAuth {
                access_token,
                refresh_token,
                token_type,
            } => {
                assert_eq!(access_token.expose(), "acc");
                assert_eq!(refresh_token.unwrap().expose(), "ref");
                assert_eq!(token_type, "Bearer");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn debug_of_payload_redacts_secrets() {
        let payload = SecretPayload::ApiKey {
            key: Secret::new("sk-live-abcdef"),
        };
        let rendered = format!("{payload:?}");
        assert!(!rendered.contains("sk-live-abcdef"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn kind_parse_roundtrip() {
        for kind in [
            CredentialKind::OAuth,
            CredentialKind::ApiKey,
            CredentialKind::Basic,
        ] {
            assert_eq!(CredentialKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CredentialKind::parse("cookie"), None);
    }
}
