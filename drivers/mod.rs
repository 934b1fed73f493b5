// Driver package / 驱动包
pub mod azure;
pub mod google;
pub mod minio;
pub mod oss;
pub mod s3;

use std::sync::Arc;

use crate::storage::ProviderRegistry;

/// Register all drivers to the registry / 注册所有驱动
pub fn register_all(registry: &mut ProviderRegistry) {
    // Register in-memory provider / 注册内存存储
    registry.register_factory(Arc::new(crate::storage::MemoryProviderFactory));
    // Register S3 driver / 注册S3对象存储驱动
    registry.register_factory(Arc::new(s3::S3ProviderFactory::aws()));
    // Register MinIO driver / 注册MinIO驱动
    registry.register_factory(Arc::new(minio::factory()));
    // Register Google Cloud Storage driver / 注册谷歌云存储驱动
    registry.register_factory(Arc::new(google::factory()));
    // Register Aliyun OSS driver / 注册阿里云OSS驱动
    registry.register_factory(Arc::new(oss::factory()));
    // Register Azure Blob driver / 注册Azure Blob驱动
    registry.register_factory(Arc::new(azure::AzureProviderFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Capability, ProviderKind, ProviderSelector};
    use serde_json::json;

    #[test]
    fn test_all_kinds_registered() {
        let mut registry = ProviderRegistry::new();
        register_all(&mut registry);
        for kind in [
            ProviderKind::S3,
            ProviderKind::Azure,
            ProviderKind::Google,
            ProviderKind::Minio,
            ProviderKind::Oss,
            ProviderKind::Memory,
        ] {
            assert!(registry.has_factory(kind), "{kind} missing");
        }
    }

    #[test]
    fn test_split_bindings() {
        let mut registry = ProviderRegistry::new();
        register_all(&mut registry);
        registry
            .bind(Capability::ServerStorage, ProviderSelector::named("memory"))
            .unwrap();
        registry
            .bind(
                Capability::PresignedUrlProvider,
                ProviderSelector::typed(json!({
                    "provider": "azure",
                    "account_name": "devaccount",
                    "account_key": "YWJj"
                })),
            )
            .unwrap();
        let bindings = registry.resolve().unwrap();
        assert_eq!(bindings.kind(Capability::ServerStorage), Some(ProviderKind::Memory));
        assert_eq!(bindings.kind(Capability::PresignedUrlProvider), Some(ProviderKind::Azure));
        assert!(bindings.client_storage().is_err());
    }
}
