//! S3-compatible driver / S3 兼容驱动
//!
//! One rust-s3 based driver serves AWS S3, MinIO, Google Cloud Storage (XML
//! API with HMAC keys) and Aliyun OSS; a `S3Flavor` carries what differs.

pub mod config;
pub mod driver;
pub mod factory;

pub use config::{S3Config, S3Flavor};
pub use driver::S3CompatDriver;
pub use factory::S3ProviderFactory;
