use {
    super::error::ChargeError,
    super::id::EstablishmentId,
    super::provider::ProviderType,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::fmt,
    uuid::Uuid,
};

/// Secret material, one shape per auth scheme.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSecret {
    /// OAuth2 client credentials exchanged over a mutual-TLS channel.
    OAuthMtls {
        client_id: String,
        client_secret: String,
        certificate_pem: String,
        private_key_pem: String,
    },
    /// Single API token sent as HTTP basic username.
    ApiToken { token: String },
    /// Long-lived bearer token.
    AccessToken { token: String },
    /// Token sent in a custom header, plus the seller token used on callbacks.
    WalletToken { token: String, seller_token: String },
}

impl CredentialSecret {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OAuthMtls { .. } => "oauth_mtls",
            Self::ApiToken { .. } => "api_token",
            Self::AccessToken { .. } => "access_token",
            Self::WalletToken { .. } => "wallet_token",
        }
    }
}

impl fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialSecret::{}(***)", self.kind())
    }
}

#[derive(Debug, Clone)]
pub struct GatewayCredential {
    pub id: Uuid,
    pub establishment_id: EstablishmentId,
    pub provider_type: ProviderType,
    pub secret: CredentialSecret,
    /// Provider host, production or sandbox.
    pub base_url: Option<String>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl GatewayCredential {
    /// Active and unexpired at `now`, or a `Configuration` error naming the pair.
    pub fn ensure_usable(&self, now: DateTime<Utc>) -> Result<(), ChargeError> {
        if !self.active {
            return Err(ChargeError::Configuration(format!(
                "credential {} for establishment {} / {} is inactive",
                self.id, self.establishment_id, self.provider_type
            )));
        }
        if self.expires_at.is_some_and(|at| at <= now) {
            return Err(ChargeError::Configuration(format!(
                "credential {} for establishment {} / {} expired",
                self.id, self.establishment_id, self.provider_type
            )));
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<&str, ChargeError> {
        self.base_url.as_deref().filter(|url| !url.trim().is_empty()).ok_or_else(|| {
            ChargeError::Configuration(format!(
                "credential {} for establishment {} / {} has no base url",
                self.id, self.establishment_id, self.provider_type
            ))
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewGatewayCredential {
    pub establishment_id: EstablishmentId,
    pub provider_type: ProviderType,
    pub secret: CredentialSecret,
    pub base_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewGatewayCredential {
    pub fn into_active(self, now: DateTime<Utc>) -> GatewayCredential {
        GatewayCredential {
            id: Uuid::now_v7(),
            establishment_id: self.establishment_id,
            provider_type: self.provider_type,
            secret: self.secret,
            base_url: self.base_url,
            active: true,
            expires_at: self.expires_at,
            created_at: now,
        }
    }
}
