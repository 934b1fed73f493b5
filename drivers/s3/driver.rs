//! S3驱动核心实现
//!
//! - 服务端操作通过 rust-s3 的 Bucket 客户端（按存储桶缓存，连接池限流）
//! - 大文件走共享分片引擎，失败或取消时自动 abort
//! - 预签名在本地完成，不访问存储服务

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::serde_types::Part;
use s3::Region;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::config::{ResolvedEndpoint, S3Config, S3Flavor};
use crate::error::{PartError, StorageError};
use crate::reference::{ObjectPrefix, ObjectReference};
use crate::sign::{encode_path, SigV4Credentials, SigV4Presigner};
use crate::storage::{
    now_seconds, validate_ttl, ClientPool, MultipartGrant, ObjectStore, Operation, PresignIssuer,
    PresignedAuthorization, ProviderInfo, SignatureArtifact, TransferConfig, TransferConfigProvider,
};
use crate::transfer::{buffer_parts, upload_parts, CompletedPart, MultipartSession, RetryPolicy, UploadPlan};

const CONTENT_TYPE: &str = "application/octet-stream";

/// S3兼容驱动
pub struct S3CompatDriver {
    flavor: S3Flavor,
    config: S3Config,
    endpoint: ResolvedEndpoint,
    presigner: SigV4Presigner,
    pool: ClientPool<Arc<Bucket>>,
}

impl S3CompatDriver {
    /// 创建新的驱动实例（不访问网络）
    pub fn new(flavor: S3Flavor, config: S3Config) -> Result<Self, StorageError> {
        let endpoint = flavor.resolve(&config)?;
        let session_token = if config.session_token.is_empty() {
            None
        } else {
            Some(config.session_token.clone())
        };
        let presigner = SigV4Presigner::new(
            flavor.dialect,
            SigV4Credentials {
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key.clone(),
                session_token,
            },
            endpoint.region.clone(),
        );

        let pool_config = config.clone();
        let pool_endpoint = endpoint.clone();
        let pool = ClientPool::new(
            flavor.kind.as_str(),
            config.pool_size,
            Arc::new(move |bucket: &str| Self::create_bucket(&pool_config, &pool_endpoint, bucket)),
        );

        Ok(Self {
            flavor,
            config,
            endpoint,
            presigner,
            pool,
        })
    }

    /// 创建S3 Bucket客户端
    fn create_bucket(config: &S3Config, endpoint: &ResolvedEndpoint, name: &str) -> Result<Arc<Bucket>, StorageError> {
        let credentials = Credentials::new(
            Some(&config.access_key_id),
            Some(&config.secret_access_key),
            if config.session_token.is_empty() { None } else { Some(&config.session_token) },
            None,
            None,
        )
        .map_err(|e| StorageError::provider(format!("创建S3凭证失败: {}", e)))?;

        let region = Region::Custom {
            region: endpoint.region.clone(),
            endpoint: endpoint.endpoint.clone(),
        };

        let bucket = Bucket::new(name, region, credentials)
            .map_err(|e| StorageError::provider(format!("创建S3 Bucket失败: {}", e)))?;

        let bucket = if endpoint.path_style {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Arc::new(*bucket))
    }

    fn ensure_credentials(&self) -> Result<(), StorageError> {
        if self.config.access_key_id.is_empty() || self.config.secret_access_key.is_empty() {
            return Err(StorageError::Signing(format!(
                "{} credentials are missing an access key id or secret",
                self.flavor.kind
            )));
        }
        Ok(())
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.sign_url_expire.max(1) as u64 * 3600).min(self.max_ttl())
    }

    /// Sign one request against an object and return (locator, query) / 签名单个请求
    fn sign_request(
        &self,
        method: &str,
        bucket: &str,
        key: &str,
        extra_query: &[(&str, &str)],
        issued_at: DateTime<Utc>,
        expires_in: i64,
    ) -> Result<(String, String), StorageError> {
        self.ensure_credentials()?;
        let (host, path) = self.endpoint.address(bucket, key);
        let encoded_path = encode_path(&path);
        let query = self
            .presigner
            .presign(method, &host, &encoded_path, extra_query, issued_at, expires_in)?;
        let locator = format!("{}://{}{}", self.endpoint.scheme, host, encoded_path);
        Ok((locator, query))
    }

    fn signed_url(
        &self,
        method: &str,
        bucket: &str,
        key: &str,
        extra_query: &[(&str, &str)],
        issued_at: DateTime<Utc>,
        expires_in: i64,
    ) -> Result<String, StorageError> {
        let (locator, query) = self.sign_request(method, bucket, key, extra_query, issued_at, expires_in)?;
        Ok(format!("{}?{}", locator, query))
    }

    /// Presign every request of an already initiated session / 预签名分片会话
    pub fn presigned_grant(
        &self,
        reference: &ObjectReference,
        upload_id: &str,
        parts: usize,
        authorization: &PresignedAuthorization,
    ) -> Result<MultipartGrant, StorageError> {
        let key = reference.key()?;
        let bucket = &reference.base_directory;
        let issued_at = authorization.issued_at;
        let expires_in = authorization.ttl().num_seconds();
        let session = [("uploadId", upload_id)];

        let part_urls = (1..=parts)
            .map(|n| {
                let part_number = n.to_string();
                self.signed_url(
                    "PUT",
                    bucket,
                    &key,
                    &[("partNumber", part_number.as_str()), ("uploadId", upload_id)],
                    issued_at,
                    expires_in,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MultipartGrant::Presigned {
            upload_id: upload_id.to_string(),
            part_urls,
            complete_url: self.signed_url("POST", bucket, &key, &session, issued_at, expires_in)?,
            abort_url: self.signed_url("DELETE", bucket, &key, &session, issued_at, expires_in)?,
        })
    }

    async fn initiate(&self, reference: &ObjectReference, key: &str) -> Result<String, StorageError> {
        let lease = self.pool.acquire(&reference.base_directory).await?;
        let response = lease
            .initiate_multipart_upload(key, CONTENT_TYPE)
            .await
            .map_err(|e| provider_error("初始化分片上传失败", e))?;
        tracing::info!(
            "{}分片上传开始: {} upload_id={}",
            self.flavor.kind,
            reference,
            response.upload_id
        );
        Ok(response.upload_id)
    }
}

#[async_trait]
impl ObjectStore for S3CompatDriver {
    fn info(&self) -> ProviderInfo {
        self.flavor.info(&self.config)
    }

    async fn upload(&self, reference: &ObjectReference, payload: Bytes) -> Result<(), StorageError> {
        let key = reference.key()?;
        let info = self.info();
        let (chunk, _) = info.plan_parts(payload.len() as u64);

        if payload.len() as u64 <= chunk {
            let lease = self.pool.acquire(&reference.base_directory).await?;
            let response = lease
                .put_object(&key, &payload)
                .await
                .map_err(|e| provider_error("上传S3对象失败", e))?;
            check_status(response.status_code(), response.as_str().unwrap_or_default())?;
            tracing::debug!("S3单次上传完成: {} ({} bytes)", reference, payload.len());
            return Ok(());
        }

        let upload_id = self.initiate(reference, &key).await?;
        // the lease is held until the session finishes
        let lease = self.pool.acquire(&reference.base_directory).await?;
        let session = Arc::new(BucketSession {
            bucket: (*lease).clone(),
            key,
            upload_id,
        });
        let mut plan = UploadPlan::new(chunk, info.max_concurrency, RetryPolicy::default());
        plan.max_parts = info.max_parts;
        let report = upload_parts(
            session,
            reference,
            buffer_parts(payload, chunk),
            &plan,
            &CancellationToken::new(),
        )
        .await?;
        tracing::info!("S3分片上传完成: {} ({} parts)", reference, report.parts);
        Ok(())
    }

    async fn download(&self, reference: &ObjectReference) -> Result<Bytes, StorageError> {
        let key = reference.key()?;
        let lease = self.pool.acquire(&reference.base_directory).await?;
        let response = match lease.get_object(&key).await {
            Ok(response) => response,
            Err(S3Error::HttpFailWithBody(404, _)) => return Err(StorageError::NotFound(reference.to_string())),
            Err(e) => return Err(provider_error("下载S3对象失败", e)),
        };
        match response.status_code() {
            200..=299 => Ok(response.bytes().clone()),
            404 => Err(StorageError::NotFound(reference.to_string())),
            status => Err(StorageError::Provider {
                status: Some(status),
                message: response.as_str().unwrap_or_default().to_string(),
            }),
        }
    }

    async fn delete(&self, reference: &ObjectReference) -> Result<(), StorageError> {
        let key = reference.key()?;
        let lease = self.pool.acquire(&reference.base_directory).await?;
        let response = match lease.delete_object(&key).await {
            Ok(response) => response,
            Err(S3Error::HttpFailWithBody(404, _)) => return Ok(()),
            Err(e) => return Err(provider_error("删除S3对象失败", e)),
        };
        match response.status_code() {
            200..=299 | 404 => Ok(()),
            status => Err(StorageError::Provider {
                status: Some(status),
                message: response.as_str().unwrap_or_default().to_string(),
            }),
        }
    }

    async fn list(&self, prefix: &ObjectPrefix) -> Result<Vec<ObjectReference>, StorageError> {
        let key_prefix = prefix.key_prefix()?;
        let lease = self.pool.acquire(&prefix.base_directory).await?;
        let results = lease
            .list(key_prefix, None)
            .await
            .map_err(|e| provider_error("列出S3对象失败", e))?;

        let mut found: Vec<ObjectReference> = results
            .into_iter()
            .flat_map(|result| result.contents)
            .filter_map(|obj| ObjectReference::from_key(&prefix.base_directory, &obj.key))
            .collect();
        found.sort_by_key(|r| r.to_string());
        Ok(found)
    }

    async fn exists(&self, reference: &ObjectReference) -> Result<bool, StorageError> {
        let key = reference.key()?;
        let lease = self.pool.acquire(&reference.base_directory).await?;
        match lease.head_object(&key).await {
            Ok((_, 200..=299)) => Ok(true),
            Ok((_, 404)) | Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Ok((_, status)) => Err(StorageError::Provider {
                status: Some(status),
                message: format!("HEAD {} failed", reference),
            }),
            Err(e) => Err(provider_error("查询S3对象失败", e)),
        }
    }
}

impl PresignIssuer for S3CompatDriver {
    fn max_ttl(&self) -> Duration {
        self.info().max_ttl
    }

    fn issue(
        &self,
        reference: &ObjectReference,
        operation: Operation,
        ttl: Duration,
    ) -> Result<PresignedAuthorization, StorageError> {
        reference.validate()?;
        let secs = validate_ttl(ttl, self.max_ttl())?;
        let key = reference.key()?;
        let method = match operation {
            Operation::Read => "GET",
            Operation::Write => "PUT",
        };
        let issued_at = now_seconds();
        let (locator, query) = self.sign_request(method, &reference.base_directory, &key, &[], issued_at, secs)?;

        Ok(PresignedAuthorization {
            operation,
            locator,
            permission: method.to_string(),
            issued_at,
            expires_at: issued_at + ChronoDuration::seconds(secs),
            signature: SignatureArtifact::QueryString(query),
        })
    }
}

#[async_trait]
impl TransferConfigProvider for S3CompatDriver {
    async fn get_config(&self, reference: &ObjectReference, operation: Operation) -> Result<TransferConfig, StorageError> {
        let authorization = self.issue(reference, operation, self.default_ttl())?;
        let info = self.info();
        Ok(TransferConfig {
            reference: reference.clone(),
            authorization,
            chunk_size: info.chunk_size,
            max_concurrency: info.max_concurrency,
            retry: RetryPolicy::default(),
            multipart: None,
        })
    }

    async fn get_upload_config(
        &self,
        reference: &ObjectReference,
        content_length: u64,
    ) -> Result<TransferConfig, StorageError> {
        let mut config = self.get_config(reference, Operation::Write).await?;
        let (chunk, parts) = self.info().plan_parts(content_length);
        if content_length <= chunk {
            return Ok(config);
        }

        let key = reference.key()?;
        let upload_id = self.initiate(reference, &key).await?;
        config.multipart = Some(self.presigned_grant(reference, &upload_id, parts, &config.authorization)?);
        config.chunk_size = chunk;
        Ok(config)
    }
}

/// 服务端分片会话
struct BucketSession {
    bucket: Arc<Bucket>,
    key: String,
    upload_id: String,
}

#[async_trait]
impl MultipartSession for BucketSession {
    fn upload_id(&self) -> &str {
        &self.upload_id
    }

    async fn upload_part(&self, part_number: u32, data: Bytes) -> Result<CompletedPart, PartError> {
        let part = self
            .bucket
            .put_multipart_chunk(data.to_vec(), &self.key, part_number, &self.upload_id, CONTENT_TYPE)
            .await
            .map_err(part_error)?;
        if part.etag.is_empty() {
            return Err(PartError::retryable(format!("part {} returned no ETag", part_number)));
        }
        Ok(CompletedPart {
            part_number,
            etag: part.etag,
        })
    }

    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<(), PartError> {
        let parts = parts
            .into_iter()
            .map(|p| Part {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        let response = self
            .bucket
            .complete_multipart_upload(&self.key, &self.upload_id, parts)
            .await
            .map_err(part_error)?;
        let body = response.as_str().unwrap_or_default();
        // CompleteMultipartUpload may report an error inside a 200 response
        if body.contains("<Error>") {
            return Err(PartError::from_status(500, body));
        }
        check_part_status(response.status_code(), body)
    }

    async fn abort(&self) -> Result<(), PartError> {
        match self.bucket.abort_upload(&self.key, &self.upload_id).await {
            Ok(()) | Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(part_error(e)),
        }
    }
}

fn check_part_status(status: u16, body: &str) -> Result<(), PartError> {
    match status {
        200..=299 => Ok(()),
        status => Err(PartError::from_status(status, body)),
    }
}

fn check_status(status: u16, body: &str) -> Result<(), StorageError> {
    check_part_status(status, body).map_err(|e| StorageError::Provider {
        status: e.status,
        message: e.message,
    })
}

fn part_error(e: S3Error) -> PartError {
    match e {
        S3Error::HttpFailWithBody(status, body) => PartError::from_status(status, &body),
        // transport level
        other => PartError::retryable(other.to_string()),
    }
}

fn provider_error(context: &str, e: S3Error) -> StorageError {
    match e {
        S3Error::HttpFailWithBody(status, body) => StorageError::Provider {
            status: Some(status),
            message: format!("{}: {}", context, body),
        },
        other => StorageError::provider(format!("{}: {}", context, other)),
    }
}
