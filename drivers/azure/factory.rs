//! Azure驱动工厂

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::sync::Arc;

use super::config::AzureConfig;
use super::driver::AzureBlobDriver;
use crate::error::{BindingError, StorageError};
use crate::storage::{ProviderBundle, ProviderFactory, ProviderKind};

/// Azure驱动工厂
pub struct AzureProviderFactory;

fn invalid(reason: impl Into<String>) -> StorageError {
    BindingError::InvalidSettings {
        provider: "azure".to_string(),
        reason: reason.into(),
    }
    .into()
}

impl ProviderFactory for AzureProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn create(&self, settings: Value) -> Result<ProviderBundle, StorageError> {
        let config: AzureConfig =
            serde_json::from_value(settings).map_err(|e| invalid(format!("配置解析失败: {}", e)))?;
        if config.account_name.trim().is_empty() {
            return Err(invalid("account_name is required"));
        }
        if BASE64.decode(config.account_key.trim()).map(|k| k.is_empty()).unwrap_or(true) {
            return Err(invalid("account_key must be the base64 account key"));
        }
        if config.pool_size == 0 {
            return Err(invalid("pool_size must be at least 1"));
        }
        let endpoint = config.blob_endpoint();
        if url::Url::parse(&endpoint).is_err() {
            return Err(invalid(format!("bad endpoint {}", endpoint)));
        }

        tracing::info!("Azure driver initialized for account {} at {}", config.account_name, endpoint);
        Ok(ProviderBundle::from_driver(
            ProviderKind::Azure,
            Arc::new(AzureBlobDriver::new(config)),
        ))
    }
}
