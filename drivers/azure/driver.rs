//! Azure驱动核心实现

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::config::AzureConfig;
use super::types::EnumerationResults;
use crate::error::StorageError;
use crate::reference::{ObjectPrefix, ObjectReference};
use crate::sign::{encode_path, BlobSasBuilder, SasResource};
use crate::storage::{
    join_query, now_seconds, validate_ttl, ClientPool, MultipartGrant, ObjectStore, Operation, PresignIssuer,
    PresignedAuthorization, ProviderInfo, ProviderKind, SignatureArtifact, TransferConfig, TransferConfigProvider,
};
use crate::transfer::{
    download_ranges, upload_source, DownloadMode, DownloadPlan, PresignedHttpTarget, RetryPolicy, UploadPlan,
    UploadSource,
};

/// 最多提交的块数
pub const MAX_BLOCKS: usize = 50_000;
const MAX_SIGN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
/// Validity of the tokens the driver signs for its own single requests
const INTERNAL_TTL: Duration = Duration::from_secs(15 * 60);
/// Validity behind the driver's own chunked transfers, which may run for hours
const SERVER_TRANSFER_TTL: Duration = MAX_SIGN_TTL;

/// Azure Blob 驱动
pub struct AzureBlobDriver {
    config: AzureConfig,
    endpoint: String,
    pool: ClientPool<reqwest::Client>,
}

impl AzureBlobDriver {
    pub fn new(config: AzureConfig) -> Self {
        let endpoint = config.blob_endpoint();
        let pool = ClientPool::new(
            "azure",
            config.pool_size,
            Arc::new(|_container: &str| {
                reqwest::Client::builder()
                    .build()
                    .map_err(|e| StorageError::provider(format!("创建HTTP客户端失败: {}", e)))
            }),
        );
        Self { config, endpoint, pool }
    }

    fn ensure_credentials(&self) -> Result<(), StorageError> {
        if self.config.account_name.is_empty() || self.config.account_key.is_empty() {
            return Err(StorageError::Signing("azure account name or key is missing".to_string()));
        }
        Ok(())
    }

    fn protocol(&self) -> Option<&'static str> {
        if self.endpoint.starts_with("http://") {
            None
        } else {
            Some("https")
        }
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.sign_url_expire.max(1) as u64 * 3600).min(MAX_SIGN_TTL)
    }

    fn blob_locator(&self, reference: &ObjectReference) -> Result<String, StorageError> {
        Ok(format!(
            "{}/{}/{}",
            self.endpoint,
            reference.base_directory,
            encode_path(&reference.key()?)
        ))
    }

    /// Sign a SAS token / 签发 SAS 令牌
    fn sign(
        &self,
        container: &str,
        blob: &str,
        resource: SasResource,
        permissions: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, StorageError> {
        self.ensure_credentials()?;
        BlobSasBuilder {
            account: &self.config.account_name,
            container,
            blob,
            resource,
            permissions,
            start: issued_at,
            expiry: expires_at,
            protocol: self.protocol(),
        }
        .sign(&self.config.account_key)
    }

    /// Short-lived blob URL for the driver's own request
    fn internal_url(&self, reference: &ObjectReference, permissions: &str) -> Result<String, StorageError> {
        let issued_at = now_seconds();
        let token = self.sign(
            &reference.base_directory,
            &reference.key()?,
            SasResource::Blob,
            permissions,
            issued_at,
            issued_at + ChronoDuration::seconds(INTERNAL_TTL.as_secs() as i64),
        )?;
        Ok(join_query(&self.blob_locator(reference)?, &token))
    }

    /// One page of `List Blobs` URL / 列表请求地址
    pub fn list_url(&self, prefix: &ObjectPrefix, marker: Option<&str>) -> Result<String, StorageError> {
        let key_prefix = prefix.key_prefix()?;
        let issued_at = now_seconds();
        let token = self.sign(
            &prefix.base_directory,
            "",
            SasResource::Container,
            "l",
            issued_at,
            issued_at + ChronoDuration::seconds(INTERNAL_TTL.as_secs() as i64),
        )?;
        let mut url = format!("{}/{}?restype=container&comp=list", self.endpoint, prefix.base_directory);
        if !key_prefix.is_empty() {
            url.push_str(&format!("&prefix={}", urlencoding::encode(&key_prefix)));
        }
        if let Some(marker) = marker {
            url.push_str(&format!("&marker={}", urlencoding::encode(marker)));
        }
        Ok(join_query(&url, &token))
    }

    fn transfer_config(
        &self,
        reference: &ObjectReference,
        operation: Operation,
        ttl: Duration,
    ) -> Result<TransferConfig, StorageError> {
        let authorization = self.issue(reference, operation, ttl)?;
        let info = self.info();
        Ok(TransferConfig {
            reference: reference.clone(),
            authorization,
            chunk_size: info.chunk_size,
            max_concurrency: info.max_concurrency,
            retry: RetryPolicy::default(),
            multipart: match operation {
                Operation::Write => Some(MultipartGrant::BlockList { max_blocks: MAX_BLOCKS }),
                Operation::Read => None,
            },
        })
    }

    /// Upload plan for the driver's own transfer: no local deadline, the
    /// token outlives the transfer / 服务端上传计划
    fn server_upload_plan(&self, config: &TransferConfig, content_length: u64) -> UploadPlan {
        let (chunk, _) = self.info().plan_parts(content_length);
        let mut plan = UploadPlan::new(chunk, config.max_concurrency, config.retry);
        plan.max_parts = MAX_BLOCKS;
        plan
    }

    fn server_download_plan(&self, config: &TransferConfig) -> DownloadPlan {
        DownloadPlan {
            chunk_size: config.chunk_size,
            max_concurrency: config.max_concurrency,
            retry: config.retry,
            expires_at: None,
        }
    }
}

#[async_trait]
impl ObjectStore for AzureBlobDriver {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::Azure,
            chunk_size: self.config.chunk_size(),
            min_part_size: 1,
            max_parts: MAX_BLOCKS,
            max_concurrency: self.config.max_concurrency.max(1),
            max_ttl: MAX_SIGN_TTL,
        }
    }

    async fn upload(&self, reference: &ObjectReference, payload: Bytes) -> Result<(), StorageError> {
        let config = self.transfer_config(reference, Operation::Write, SERVER_TRANSFER_TTL)?;
        let lease = self.pool.acquire(&reference.base_directory).await?;
        let target = PresignedHttpTarget::new((*lease).clone(), &config)?;
        let plan = self.server_upload_plan(&config, payload.len() as u64);
        let report = upload_source(
            &target,
            reference,
            UploadSource::Buffer(payload),
            &plan,
            &CancellationToken::new(),
        )
        .await?;
        tracing::debug!("Azure上传完成: {} ({} blocks)", reference, report.parts);
        Ok(())
    }

    async fn download(&self, reference: &ObjectReference) -> Result<Bytes, StorageError> {
        let config = self.transfer_config(reference, Operation::Read, SERVER_TRANSFER_TTL)?;
        let lease = self.pool.acquire(&reference.base_directory).await?;
        let target = PresignedHttpTarget::new((*lease).clone(), &config)?;
        let plan = self.server_download_plan(&config);
        let result = download_ranges(Arc::new(target), reference, &plan, DownloadMode::Buffer).await;
        match result {
            Ok(result) => result.into_bytes().await,
            Err(StorageError::TransferFailed { status: Some(404), .. }) => {
                Err(StorageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, reference: &ObjectReference) -> Result<(), StorageError> {
        let url = self.internal_url(reference, "d")?;
        let lease = self.pool.acquire(&reference.base_directory).await?;
        let resp = lease.delete(url).send().await.map_err(http_error)?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(StorageError::Provider {
                status: Some(s.as_u16()),
                message: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn list(&self, prefix: &ObjectPrefix) -> Result<Vec<ObjectReference>, StorageError> {
        prefix.validate()?;
        let lease = self.pool.acquire(&prefix.base_directory).await?;
        let mut found = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let url = self.list_url(prefix, marker.as_deref())?;
            let resp = lease.get(url).send().await.map_err(http_error)?;
            let status = resp.status();
            let body = resp.text().await.map_err(http_error)?;
            if !status.is_success() {
                return Err(StorageError::Provider {
                    status: Some(status.as_u16()),
                    message: body,
                });
            }
            let page: EnumerationResults = quick_xml::de::from_str(&body)
                .map_err(|e| StorageError::provider(format!("解析Azure列表失败: {}", e)))?;
            found.extend(
                page.blobs
                    .blob
                    .iter()
                    .filter_map(|b| ObjectReference::from_key(&prefix.base_directory, &b.name)),
            );
            match page.marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        found.sort_by_key(|r| r.to_string());
        Ok(found)
    }

    async fn exists(&self, reference: &ObjectReference) -> Result<bool, StorageError> {
        let url = self.internal_url(reference, "r")?;
        let lease = self.pool.acquire(&reference.base_directory).await?;
        let resp = lease.head(url).send().await.map_err(http_error)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::Provider {
                status: Some(s.as_u16()),
                message: format!("HEAD {} failed", reference),
            }),
        }
    }
}

impl PresignIssuer for AzureBlobDriver {
    fn max_ttl(&self) -> Duration {
        MAX_SIGN_TTL
    }

    fn issue(
        &self,
        reference: &ObjectReference,
        operation: Operation,
        ttl: Duration,
    ) -> Result<PresignedAuthorization, StorageError> {
        reference.validate()?;
        let secs = validate_ttl(ttl, self.max_ttl())?;
        let issued_at = now_seconds();
        let expires_at = issued_at + ChronoDuration::seconds(secs);
        let permission = match operation {
            Operation::Read => "r",
            Operation::Write => "w",
        };
        let token = self.sign(
            &reference.base_directory,
            &reference.key()?,
            SasResource::Blob,
            permission,
            issued_at,
            expires_at,
        )?;

        Ok(PresignedAuthorization {
            operation,
            locator: self.blob_locator(reference)?,
            permission: permission.to_string(),
            issued_at,
            expires_at,
            signature: SignatureArtifact::SasToken(token),
        })
    }
}

#[async_trait]
impl TransferConfigProvider for AzureBlobDriver {
    async fn get_config(&self, reference: &ObjectReference, operation: Operation) -> Result<TransferConfig, StorageError> {
        self.transfer_config(reference, operation, self.default_ttl())
    }
}

fn http_error(e: reqwest::Error) -> StorageError {
    StorageError::Provider {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}
