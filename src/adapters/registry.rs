use {
    super::{
        boleto::BoletoAdapter, card_invoice::CardInvoiceAdapter, retry::RetryPolicy,
        unified_checkout::UnifiedCheckoutAdapter, wallet::WalletAdapter,
    },
    crate::domain::{
        credential::GatewayCredential,
        error::ChargeError,
        provider::{ProviderAdapter, ProviderType},
    },
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::sync::RwLock,
    uuid::Uuid,
};

/// Knobs shared by every HTTP adapter.
#[derive(Debug, Clone, Copy)]
pub struct AdapterSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl AdapterSettings {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 2,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }
}

/// Builds the adapter matching a credential's provider type.
#[async_trait::async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn adapter_for(
        &self,
        credential: &GatewayCredential,
    ) -> Result<Arc<dyn ProviderAdapter>, ChargeError>;
}

/// Production factory. Adapters are cached per credential id so token
/// caches and connection pools survive across calls; rotating a credential
/// produces a new id and therefore a fresh adapter.
pub struct HttpAdapterFactory {
    settings: AdapterSettings,
    cache: RwLock<HashMap<Uuid, Arc<dyn ProviderAdapter>>>,
}

impl HttpAdapterFactory {
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn build(&self, credential: &GatewayCredential) -> Result<Arc<dyn ProviderAdapter>, ChargeError> {
        let adapter: Arc<dyn ProviderAdapter> = match credential.provider_type {
            ProviderType::Boleto => Arc::new(BoletoAdapter::new(credential, &self.settings)?),
            ProviderType::CardInvoice => {
                Arc::new(CardInvoiceAdapter::new(credential, &self.settings)?)
            }
            ProviderType::UnifiedCheckout => {
                Arc::new(UnifiedCheckoutAdapter::new(credential, &self.settings)?)
            }
            ProviderType::Wallet => Arc::new(WalletAdapter::new(credential, &self.settings)?),
        };
        Ok(adapter)
    }
}

#[async_trait::async_trait]
impl AdapterFactory for HttpAdapterFactory {
    async fn adapter_for(
        &self,
        credential: &GatewayCredential,
    ) -> Result<Arc<dyn ProviderAdapter>, ChargeError> {
        if let Some(adapter) = self.cache.read().await.get(&credential.id) {
            return Ok(Arc::clone(adapter));
        }

        let mut cache = self.cache.write().await;
        if let Some(adapter) = cache.get(&credential.id) {
            return Ok(Arc::clone(adapter));
        }
        let adapter = self.build(credential)?;
        tracing::debug!(
            credential_id = %credential.id,
            provider = %credential.provider_type,
            "built provider adapter"
        );
        cache.insert(credential.id, Arc::clone(&adapter));
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        credential::{CredentialSecret, NewGatewayCredential},
        id::EstablishmentId,
    };
    use chrono::Utc;

    fn credential(provider_type: ProviderType, secret: CredentialSecret) -> GatewayCredential {
        NewGatewayCredential {
            establishment_id: EstablishmentId::new(1).unwrap(),
            provider_type,
            secret,
            base_url: Some("http://127.0.0.1:9".into()),
            expires_at: None,
        }
        .into_active(Utc::now())
    }

    #[tokio::test]
    async fn reuses_adapter_for_same_credential() {
        let factory = HttpAdapterFactory::new(AdapterSettings::for_tests());
        let cred = credential(
            ProviderType::CardInvoice,
            CredentialSecret::ApiToken { token: "t".into() },
        );

        let first = factory.adapter_for(&cred).await.unwrap();
        let second = factory.adapter_for(&cred).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.provider_type(), ProviderType::CardInvoice);
    }

    #[tokio::test]
    async fn mismatched_secret_is_configuration_error() {
        let factory = HttpAdapterFactory::new(AdapterSettings::for_tests());
        let cred = credential(
            ProviderType::Wallet,
            CredentialSecret::ApiToken { token: "t".into() },
        );
        assert!(matches!(
            factory.adapter_for(&cred).await,
            Err(ChargeError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn missing_base_url_is_configuration_error() {
        let factory = HttpAdapterFactory::new(AdapterSettings::for_tests());
        let mut cred = credential(
            ProviderType::UnifiedCheckout,
            CredentialSecret::AccessToken { token: "t".into() },
        );
        cred.base_url = None;
        assert!(matches!(
            factory.adapter_for(&cred).await,
            Err(ChargeError::Configuration(_))
        ));
    }
}
