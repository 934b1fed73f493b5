//! S3驱动工厂

use serde_json::Value;
use std::sync::Arc;

use super::config::{S3Config, S3Flavor};
use super::driver::S3CompatDriver;
use crate::error::StorageError;
use crate::storage::{ObjectStore, ProviderBundle, ProviderFactory, ProviderKind};

/// S3兼容驱动工厂，`flavor` 决定具体提供方
pub struct S3ProviderFactory {
    flavor: S3Flavor,
}

impl S3ProviderFactory {
    pub const fn new(flavor: S3Flavor) -> Self {
        Self { flavor }
    }

    pub const fn aws() -> Self {
        Self::new(S3Flavor::AWS)
    }

    /// Parse and check settings without building clients / 解析配置
    pub fn parse_settings(&self, settings: Value) -> Result<S3Config, StorageError> {
        let config: S3Config =
            serde_json::from_value(settings).map_err(|e| self.flavor.invalid(&format!("配置解析失败: {}", e)))?;
        if config.access_key_id.trim().is_empty() || config.secret_access_key.trim().is_empty() {
            return Err(self
                .flavor
                .invalid("access_key_id and secret_access_key are required")
                .into());
        }
        if config.pool_size == 0 {
            return Err(self.flavor.invalid("pool_size must be at least 1").into());
        }
        // endpoint problems surface at bind time
        self.flavor.resolve(&config)?;
        Ok(config)
    }
}

impl ProviderFactory for S3ProviderFactory {
    fn kind(&self) -> ProviderKind {
        self.flavor.kind
    }

    fn create(&self, settings: Value) -> Result<ProviderBundle, StorageError> {
        let config = self.parse_settings(settings)?;
        let driver = S3CompatDriver::new(self.flavor, config)?;
        tracing::info!(
            "{} driver initialized (chunk {} bytes, concurrency {})",
            self.flavor.kind,
            driver.info().chunk_size,
            driver.info().max_concurrency
        );
        Ok(ProviderBundle::from_driver(self.flavor.kind, Arc::new(driver)))
    }
}
