//! Credential variants for authenticating broker sessions.

use serde::{Deserialize, Serialize};

/// Polymorphic credentials, one immutable value per variant.
///
/// Rotation never mutates an existing value: a new [`Credentials`] is built
/// into a new `Connection` descriptor and swapped in by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Credentials {
    /// Anonymous access.
    #[default]
    None,

    /// Username/password.
    Basic {
        username: String,
        password: String,
    },

    /// Mutual TLS with a client certificate.
    ClientCertificate {
        /// PEM-encoded certificate chain.
        certificate: String,
        /// PEM-encoded private key.
        private_key: String,
    },

    /// OAuth 2.0 client-credentials flow.
    OAuthClientCredentials {
        token_endpoint: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

impl Credentials {
    /// Short label for logs; never leaks secret material.
    pub fn as_label(&self) -> &'static str {
        match self {
            Credentials::None => "none",
            Credentials::Basic { .. } => "basic",
            Credentials::ClientCertificate { .. } => "client-certificate",
            Credentials::OAuthClientCredentials { .. } => "oauth-client-credentials",
        }
    }
}
