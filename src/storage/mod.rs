use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BindingError, StorageError, ValidationError};
use crate::reference::{ObjectPrefix, ObjectReference};
use crate::transfer::RetryPolicy;

pub const MIB: u64 = 1024 * 1024;

/// Operation class of a grant / 授权操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "r" | "get" => Ok(Operation::Read),
            "write" | "w" | "put" => Ok(Operation::Write),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// Built-in provider kinds / 内置存储提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    S3,
    Azure,
    Google,
    Minio,
    Oss,
    Memory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "s3",
            ProviderKind::Azure => "azure",
            ProviderKind::Google => "google",
            ProviderKind::Minio => "minio",
            ProviderKind::Oss => "oss",
            ProviderKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(ProviderKind::S3),
            "azure" => Ok(ProviderKind::Azure),
            "google" | "gcs" => Ok(ProviderKind::Google),
            "minio" => Ok(ProviderKind::Minio),
            "oss" => Ok(ProviderKind::Oss),
            "memory" => Ok(ProviderKind::Memory),
            other => Err(BindingError::UnknownProvider(other.to_string())),
        }
    }
}

/// Provider-specific signature artifact / 签名产物
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum SignatureArtifact {
    /// Signed query string bound to one method and URL (SigV4 family)
    QueryString(String),
    /// Reusable token for every request of the granted permission (Azure SAS)
    SasToken(String),
}

impl SignatureArtifact {
    pub fn as_query(&self) -> &str {
        match self {
            SignatureArtifact::QueryString(q) | SignatureArtifact::SasToken(q) => q,
        }
    }

    pub fn is_reusable(&self) -> bool {
        matches!(self, SignatureArtifact::SasToken(_))
    }
}

/// Presigned authorization / 预签名授权
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedAuthorization {
    pub operation: Operation,
    /// Object URL without signature / 对象地址（不含签名）
    pub locator: String,
    /// Permission descriptor covered by the signature / 签名覆盖的权限描述
    pub permission: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub signature: SignatureArtifact,
}

impl PresignedAuthorization {
    /// Full request URL / 完整请求地址
    pub fn url(&self) -> String {
        join_query(&self.locator, self.signature.as_query())
    }

    pub fn ttl(&self) -> ChronoDuration {
        self.expires_at - self.issued_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Fail with `ExpiredAuthorization` if the grant is no longer valid
    pub fn ensure_valid(&self) -> Result<(), StorageError> {
        if self.is_expired() {
            return Err(StorageError::ExpiredAuthorization {
                expired_at: self.expires_at,
            });
        }
        Ok(())
    }
}

/// Append a query string to a URL that may already carry one
pub fn join_query(url: &str, query: &str) -> String {
    if query.is_empty() {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&{}", url, query)
    } else {
        format!("{}?{}", url, query)
    }
}

/// How a large write may be split / 分片授权
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MultipartGrant {
    /// Blocks staged and committed under the authorization's own token (Azure)
    #[serde(rename_all = "camelCase")]
    BlockList { max_blocks: usize },
    /// Session already opened by the issuer; one signed URL per part (SigV4 family)
    #[serde(rename_all = "camelCase")]
    Presigned {
        upload_id: String,
        part_urls: Vec<String>,
        complete_url: String,
        abort_url: String,
    },
    /// In-process session held by the memory provider
    #[serde(rename_all = "camelCase")]
    Session { upload_id: String },
}

impl MultipartGrant {
    /// Maximum number of parts the grant can carry / 最多可上传分片数
    pub fn max_parts(&self) -> usize {
        match self {
            MultipartGrant::BlockList { max_blocks } => *max_blocks,
            MultipartGrant::Presigned { part_urls, .. } => part_urls.len(),
            MultipartGrant::Session { .. } => usize::MAX,
        }
    }
}

/// Everything an untrusted client needs to finish a transfer / 传输配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    pub reference: ObjectReference,
    pub authorization: PresignedAuthorization,
    pub chunk_size: u64,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart: Option<MultipartGrant>,
}

impl TransferConfig {
    pub fn operation(&self) -> Operation {
        self.authorization.operation
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.authorization.expires_at
    }
}

/// Provider description / 提供方能力声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    /// Payloads above this size use multipart / 分片阈值（也是分片大小）
    pub chunk_size: u64,
    /// Provider minimum size of a non-final part / 最小分片
    pub min_part_size: u64,
    pub max_parts: usize,
    pub max_concurrency: usize,
    /// Longest signature validity accepted / 最长签名有效期
    pub max_ttl: Duration,
}

impl ProviderInfo {
    /// Chunk size and part count for a payload, growing the chunk when the
    /// provider part limit would be exceeded / 计算分片大小与分片数
    pub fn plan_parts(&self, content_length: u64) -> (u64, usize) {
        let mut chunk = self.chunk_size.max(self.min_part_size).max(1);
        let max_parts = self.max_parts.max(1) as u64;
        if content_length.div_ceil(chunk) > max_parts {
            chunk = content_length.div_ceil(max_parts).div_ceil(MIB) * MIB;
        }
        let parts = content_length.div_ceil(chunk).max(1);
        (chunk, parts as usize)
    }
}

/// Check a requested ttl and return it in whole seconds / 校验有效期
pub fn validate_ttl(ttl: Duration, max: Duration) -> Result<i64, ValidationError> {
    if ttl.is_zero() {
        return Err(ValidationError::InvalidTtl("ttl must be positive".to_string()));
    }
    if ttl.subsec_nanos() != 0 {
        return Err(ValidationError::InvalidTtl(format!(
            "ttl must be a whole number of seconds, got {:?}",
            ttl
        )));
    }
    if ttl > max {
        return Err(ValidationError::InvalidTtl(format!(
            "ttl {}s exceeds provider maximum {}s",
            ttl.as_secs(),
            max.as_secs()
        )));
    }
    Ok(ttl.as_secs() as i64)
}

/// Current time truncated to whole seconds (signature timestamps have second precision)
pub fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// Server-side provider client wrapper / 服务端存储接口
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn info(&self) -> ProviderInfo;

    /// Store a payload, splitting it into parts above the chunk size / 上传对象
    async fn upload(&self, reference: &ObjectReference, payload: Bytes) -> Result<(), StorageError>;

    /// Fetch a whole object / 下载对象
    async fn download(&self, reference: &ObjectReference) -> Result<Bytes, StorageError>;

    /// Delete an object, succeeding when it is already absent / 删除对象
    async fn delete(&self, reference: &ObjectReference) -> Result<(), StorageError>;

    /// Recursive listing under a prefix / 列出对象
    async fn list(&self, prefix: &ObjectPrefix) -> Result<Vec<ObjectReference>, StorageError>;

    async fn exists(&self, reference: &ObjectReference) -> Result<bool, StorageError>;
}

/// Presigned authorization issuer / 预签名签发
///
/// Signing is local: implementations never contact the provider here.
pub trait PresignIssuer: Send + Sync {
    fn max_ttl(&self) -> Duration;

    fn issue(
        &self,
        reference: &ObjectReference,
        operation: Operation,
        ttl: Duration,
    ) -> Result<PresignedAuthorization, StorageError>;
}

/// Transfer configuration provider / 传输配置
#[async_trait]
pub trait TransferConfigProvider: Send + Sync {
    async fn get_config(
        &self,
        reference: &ObjectReference,
        operation: Operation,
    ) -> Result<TransferConfig, StorageError>;

    /// Write config sized for a known payload. Providers that need an open
    /// session per upload override this / 按大小申请上传配置
    async fn get_upload_config(
        &self,
        reference: &ObjectReference,
        content_length: u64,
    ) -> Result<TransferConfig, StorageError> {
        let _ = content_length;
        self.get_config(reference, Operation::Write).await
    }
}

/// One provider's implementation graph / 一个提供方的完整实现
#[derive(Clone)]
pub struct ProviderBundle {
    pub kind: ProviderKind,
    pub store: Arc<dyn ObjectStore>,
    pub issuer: Arc<dyn PresignIssuer>,
    pub transfer: Arc<dyn TransferConfigProvider>,
}

impl ProviderBundle {
    /// Wire all three capabilities to one driver instance
    pub fn from_driver<D>(kind: ProviderKind, driver: Arc<D>) -> Self
    where
        D: ObjectStore + PresignIssuer + TransferConfigProvider + 'static,
    {
        Self {
            kind,
            store: driver.clone(),
            issuer: driver.clone(),
            transfer: driver,
        }
    }
}

impl fmt::Debug for ProviderBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderBundle").field("kind", &self.kind).finish()
    }
}

pub mod memory;
pub mod pool;
pub mod registry;

pub use memory::{MemoryProvider, MemoryProviderFactory};
pub use pool::{ClientLease, ClientPool};
pub use registry::{
    BindingStrategy, Capability, EnvSource, ProcessEnv, ProviderFactory, ProviderRegistry,
    ProviderSelector, StorageBindings,
};
