//! MinIO driver / MinIO 驱动
//!
//! Self-hosted S3 API: the endpoint is mandatory and requests are path-style.

use crate::sign::SigV4Dialect;
use crate::storage::{ProviderKind, MIB};

use super::s3::{S3Flavor, S3ProviderFactory};

pub const FLAVOR: S3Flavor = S3Flavor {
    kind: ProviderKind::Minio,
    dialect: SigV4Dialect::AWS,
    default_region: "us-east-1",
    endpoint_template: "",
    path_style: true,
    chunk_size: 16 * MIB,
    min_part_size: 5 * MIB,
    max_parts: 10_000,
    max_concurrency: 4,
};

pub fn factory() -> S3ProviderFactory {
    S3ProviderFactory::new(FLAVOR)
}
