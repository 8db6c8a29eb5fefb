use std::sync::Arc;

use async_trait::async_trait;

use common::models::{CredentialCipher, Credentials, ExchangeId, TenantConfig};

use crate::binance::BinanceFutures;
use crate::bybit::BybitFutures;
use crate::error::ExchangeError;
use crate::Exchange;

/// Builds one exchange session per tenant. Sessions wrap tenant-specific
/// credentials and are never shared across tenants.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, tenant: &TenantConfig) -> Result<Arc<dyn Exchange>, ExchangeError>;
}

pub struct LiveConnector {
    cipher: Arc<dyn CredentialCipher>,
}

impl LiveConnector {
    pub fn new(cipher: Arc<dyn CredentialCipher>) -> Self {
        Self { cipher }
    }

    fn reveal(&self, tenant: &TenantConfig) -> Result<Credentials, ExchangeError> {
        if tenant.credentials.is_empty() {
            return Err(ExchangeError::Auth(format!(
                "tenant {} has no credentials for {}",
                tenant.id, tenant.exchange
            )));
        }
        let api_key = self
            .cipher
            .decrypt(&tenant.credentials.api_key)
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        let api_secret = self
            .cipher
            .decrypt(&tenant.credentials.api_secret)
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        Ok(Credentials::new(
            api_key.trim().to_string(),
            api_secret.trim().to_string(),
        ))
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn connect(&self, tenant: &TenantConfig) -> Result<Arc<dyn Exchange>, ExchangeError> {
        let credentials = self.reveal(tenant)?;
        match tenant.exchange {
            ExchangeId::Binance => Ok(Arc::new(
                BinanceFutures::connect(credentials, None).await?,
            )),
            ExchangeId::Bybit => Ok(Arc::new(BybitFutures::connect(credentials, None).await?)),
        }
    }
}
