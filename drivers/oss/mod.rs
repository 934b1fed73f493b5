//! Aliyun OSS driver / 阿里云OSS驱动
//!
//! S3-compatible API on `oss-{region}.aliyuncs.com`; OSS only accepts
//! virtual-hosted requests.

use crate::sign::SigV4Dialect;
use crate::storage::{ProviderKind, MIB};

use super::s3::{S3Flavor, S3ProviderFactory};

pub const FLAVOR: S3Flavor = S3Flavor {
    kind: ProviderKind::Oss,
    dialect: SigV4Dialect::AWS,
    default_region: "cn-hangzhou",
    endpoint_template: "https://oss-{region}.aliyuncs.com",
    path_style: false,
    chunk_size: 8 * MIB,
    // 100 KiB
    min_part_size: 100 * 1024,
    max_parts: 10_000,
    max_concurrency: 4,
};

pub fn factory() -> S3ProviderFactory {
    S3ProviderFactory::new(FLAVOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ObjectReference;
    use crate::storage::{Operation, ProviderFactory};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_virtual_hosted_locator() {
        let bundle = factory()
            .create(json!({
                "region": "cn-shanghai",
                "access_key_id": "LTAI",
                "secret_access_key": "secret"
            }))
            .unwrap();
        assert_eq!(bundle.kind, ProviderKind::Oss);
        assert_eq!(bundle.store.info().min_part_size, 100 * 1024);

        let auth = bundle
            .issuer
            .issue(&ObjectReference::new("media", "", "a.mp4"), Operation::Read, Duration::from_secs(60))
            .unwrap();
        assert_eq!(auth.locator, "https://media.oss-cn-shanghai.aliyuncs.com/a.mp4");
    }

    #[test]
    fn test_small_chunks_allowed() {
        let bundle = factory()
            .create(json!({ "access_key_id": "LTAI", "secret_access_key": "secret", "chunk_size_mib": 1 }))
            .unwrap();
        assert_eq!(bundle.store.info().chunk_size, MIB);
    }
}
