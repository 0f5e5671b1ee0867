use aws_credential_types::Credentials;

use crate::BlobAddress;

/// Credential selection made by the caller when opening a handle
#[derive(Debug, Clone, Default)]
pub enum Credential {
    /// Resolve credentials from the environment (default provider chain)
    #[default]
    Default,
    /// Send unsigned requests, or rely on a token embedded in the address
    Anonymous,
    /// Use exactly these credentials
    Explicit(Credentials),
}

/// What a transfer client should actually authenticate with
#[derive(Debug, Clone)]
pub enum ResolvedCredential {
    Ambient,
    Anonymous,
    Explicit(Credentials),
}

impl ResolvedCredential {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl Credential {
    /// A pre-signed address wins over any other selection since its token
    /// already authorizes the request.
    pub fn resolve(self, address: &BlobAddress) -> ResolvedCredential {
        if address.has_presigned_signature() {
            return ResolvedCredential::Anonymous;
        }
        match self {
            Credential::Default => ResolvedCredential::Ambient,
            Credential::Anonymous => ResolvedCredential::Anonymous,
            Credential::Explicit(credentials) => ResolvedCredential::Explicit(credentials),
        }
    }
}

impl From<Credentials> for Credential {
    fn from(credentials: Credentials) -> Self {
        Credential::Explicit(credentials)
    }
}
