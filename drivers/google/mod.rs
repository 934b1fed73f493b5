//! Google Cloud Storage driver / 谷歌云存储驱动
//!
//! Uses the XML API with HMAC interoperability keys. Server-side calls go
//! through the S3-compatible client; grants use V4 signing (`GOOG4-HMAC-SHA256`).

use crate::sign::SigV4Dialect;
use crate::storage::{ProviderKind, MIB};

use super::s3::{S3Flavor, S3ProviderFactory};

pub const FLAVOR: S3Flavor = S3Flavor {
    kind: ProviderKind::Google,
    dialect: SigV4Dialect::GOOG4,
    default_region: "auto",
    endpoint_template: "https://storage.googleapis.com",
    path_style: true,
    chunk_size: 8 * MIB,
    min_part_size: 5 * MIB,
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
    fn test_goog4_grant() {
        let bundle = factory()
            .create(json!({ "access_key_id": "GOOG1EXAMPLE", "secret_access_key": "secret" }))
            .unwrap();
        let auth = bundle
            .issuer
            .issue(&ObjectReference::new("bucket", "dir", "file.bin"), Operation::Write, Duration::from_secs(900))
            .unwrap();
        assert_eq!(auth.locator, "https://storage.googleapis.com/bucket/dir/file.bin");
        assert_eq!(auth.permission, "PUT");
        let query = auth.signature.as_query();
        assert!(query.starts_with("X-Goog-Algorithm=GOOG4-HMAC-SHA256&"));
        assert!(query.contains("%2Fauto%2Fstorage%2Fgoog4_request"));
        assert!(query.contains("&X-Goog-Signature="));
    }
}
