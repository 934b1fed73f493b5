//! S3驱动配置

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::BindingError;
use crate::sign::SigV4Dialect;
use crate::storage::{ProviderInfo, ProviderKind, MIB};

/// 最长签名有效期（SigV4 限制 7 天）
pub const MAX_SIGN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// S3配置
///
/// The bucket is not part of the settings: every `ObjectReference` names
/// its own bucket through `base_directory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3端点地址
    /// AWS: https://s3.{region}.amazonaws.com
    /// 阿里云OSS: https://oss-{region}.aliyuncs.com
    /// MinIO: http://localhost:9000
    #[serde(default)]
    pub endpoint: String,
    /// 区域
    #[serde(default)]
    pub region: String,
    /// Access Key ID
    #[serde(default)]
    pub access_key_id: String,
    /// Secret Access Key
    #[serde(default)]
    pub secret_access_key: String,
    /// Session Token（用于临时凭证）
    #[serde(default)]
    pub session_token: String,
    /// 预签名URL过期时间（小时）
    #[serde(default = "default_sign_expire")]
    pub sign_url_expire: u32,
    /// 强制使用路径风格（而非虚拟主机风格）
    /// MinIO等需要设置为true
    #[serde(default)]
    pub force_path_style: bool,
    /// 分片大小（MB），不填使用提供方默认值
    #[serde(default)]
    pub chunk_size_mib: Option<u64>,
    /// 并发上传分片数
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// 同时使用的客户端数量上限
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_sign_expire() -> u32 {
    4
}

fn default_pool_size() -> usize {
    16
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: String::new(),
            sign_url_expire: default_sign_expire(),
            force_path_style: false,
            chunk_size_mib: None,
            max_concurrency: None,
            pool_size: default_pool_size(),
        }
    }
}

/// What differs between S3-compatible providers / S3 兼容提供方差异
#[derive(Debug, Clone, Copy)]
pub struct S3Flavor {
    pub kind: ProviderKind,
    /// Presign dialect
    pub dialect: SigV4Dialect,
    pub default_region: &'static str,
    /// Endpoint template, `{region}` is substituted; empty means required
    pub endpoint_template: &'static str,
    pub path_style: bool,
    pub chunk_size: u64,
    pub min_part_size: u64,
    pub max_parts: usize,
    pub max_concurrency: usize,
}

impl S3Flavor {
    pub const AWS: S3Flavor = S3Flavor {
        kind: ProviderKind::S3,
        dialect: SigV4Dialect::AWS,
        default_region: "us-east-1",
        endpoint_template: "https://s3.{region}.amazonaws.com",
        path_style: false,
        chunk_size: 8 * MIB,
        min_part_size: 5 * MIB,
        max_parts: 10_000,
        max_concurrency: 4,
    };

    /// Resolve region and endpoint from settings / 解析区域与端点
    pub fn resolve(&self, config: &S3Config) -> Result<ResolvedEndpoint, BindingError> {
        let region = if config.region.trim().is_empty() {
            self.default_region.to_string()
        } else {
            config.region.trim().to_string()
        };

        let endpoint = if !config.endpoint.trim().is_empty() {
            config.endpoint.trim().trim_end_matches('/').to_string()
        } else if !self.endpoint_template.is_empty() {
            self.endpoint_template.replace("{region}", &region)
        } else {
            return Err(self.invalid("endpoint is required"));
        };

        let url = Url::parse(&endpoint).map_err(|e| self.invalid(&format!("bad endpoint {}: {}", endpoint, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| self.invalid(&format!("endpoint {} has no host", endpoint)))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(ResolvedEndpoint {
            scheme: url.scheme().to_string(),
            host,
            endpoint,
            region,
            path_style: config.force_path_style || self.path_style,
        })
    }

    pub fn info(&self, config: &S3Config) -> ProviderInfo {
        ProviderInfo {
            kind: self.kind,
            chunk_size: config
                .chunk_size_mib
                .map(|m| m * MIB)
                .unwrap_or(self.chunk_size)
                .max(self.min_part_size),
            min_part_size: self.min_part_size,
            max_parts: self.max_parts,
            max_concurrency: config.max_concurrency.unwrap_or(self.max_concurrency).max(1),
            max_ttl: MAX_SIGN_TTL,
        }
    }

    pub fn invalid(&self, reason: &str) -> BindingError {
        BindingError::InvalidSettings {
            provider: self.kind.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Endpoint after defaults / 解析后的端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub scheme: String,
    /// Host with a non-default port
    pub host: String,
    pub endpoint: String,
    pub region: String,
    pub path_style: bool,
}

impl ResolvedEndpoint {
    /// Host and unencoded path addressing `key` in `bucket`
    pub fn address(&self, bucket: &str, key: &str) -> (String, String) {
        if self.path_style {
            (self.host.clone(), format!("/{}/{}", bucket, key))
        } else {
            (format!("{}.{}", bucket, self.host), format!("/{}", key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        let resolved = S3Flavor::AWS
            .resolve(&S3Config {
                region: "eu-west-1".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.endpoint, "https://s3.eu-west-1.amazonaws.com");
        assert_eq!(resolved.host, "s3.eu-west-1.amazonaws.com");
        assert!(!resolved.path_style);
        assert_eq!(
            resolved.address("bucket", "a/f.bin"),
            ("bucket.s3.eu-west-1.amazonaws.com".to_string(), "/a/f.bin".to_string())
        );
    }

    #[test]
    fn test_custom_endpoint_with_port() {
        let resolved = S3Flavor::AWS
            .resolve(&S3Config {
                endpoint: "http://localhost:9000/".to_string(),
                force_path_style: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.scheme, "http");
        assert_eq!(resolved.host, "localhost:9000");
        assert_eq!(resolved.region, "us-east-1");
        assert_eq!(
            resolved.address("bucket", "f.bin"),
            ("localhost:9000".to_string(), "/bucket/f.bin".to_string())
        );
    }

    #[test]
    fn test_chunk_never_below_minimum() {
        let info = S3Flavor::AWS.info(&S3Config {
            chunk_size_mib: Some(1),
            ..Default::default()
        });
        assert_eq!(info.chunk_size, 5 * MIB);
        assert_eq!(S3Flavor::AWS.info(&S3Config::default()).chunk_size, 8 * MIB);
    }

    #[test]
    fn test_bad_endpoint() {
        let err = S3Flavor::AWS
            .resolve(&S3Config {
                endpoint: "not a url".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, BindingError::InvalidSettings { .. }));
    }
}
