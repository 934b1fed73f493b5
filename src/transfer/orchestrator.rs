//! Frontend transfer orchestrator / 前端传输编排
//!
//! Runs entirely on a `TransferConfig`: the untrusted side never sees a
//! credential, only signed URLs or a SAS token.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, ETAG, RANGE};
use reqwest::StatusCode;
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::wire::{azure_block_id, block_list_xml, check_response, complete_multipart_xml, parse_content_range, range_header};
use super::{
    download_ranges, upload_source, CompletedPart, DownloadMode, DownloadPlan, DownloadResult, MultipartSession,
    ProgressCallback, RangeChunk, RangeSource, UploadPlan, UploadReport, UploadSource, UploadTarget,
};
use crate::error::{PartError, StorageError};
use crate::storage::{join_query, MultipartGrant, Operation, SignatureArtifact, TransferConfig};

const AZURE_BLOB_TYPE: &str = "x-ms-blob-type";

/// Upload/download target speaking HTTP with presigned URLs / 基于预签名地址的 HTTP 目标
#[derive(Clone)]
pub struct PresignedHttpTarget {
    client: reqwest::Client,
    config: Arc<TransferConfig>,
}

impl PresignedHttpTarget {
    pub fn new(client: reqwest::Client, config: &TransferConfig) -> Result<Self, StorageError> {
        let locator = &config.authorization.locator;
        if !(locator.starts_with("https://") || locator.starts_with("http://")) {
            return Err(StorageError::provider(format!(
                "locator {} is not reachable over HTTP",
                locator
            )));
        }
        Ok(Self {
            client,
            config: Arc::new(config.clone()),
        })
    }

    fn is_sas(&self) -> bool {
        matches!(self.config.authorization.signature, SignatureArtifact::SasToken(_))
    }

    /// URL for an extra operation under the reusable SAS token
    fn sas_url(&self, operation_query: &str) -> String {
        let auth = &self.config.authorization;
        join_query(&join_query(&auth.locator, operation_query), auth.signature.as_query())
    }
}

#[async_trait]
impl UploadTarget for PresignedHttpTarget {
    async fn put_single(&self, data: Bytes) -> Result<(), PartError> {
        let mut req = self.client.put(self.config.authorization.url()).body(data);
        if self.is_sas() {
            req = req.header(AZURE_BLOB_TYPE, "BlockBlob");
        }
        check_response(req.send().await?).await?;
        Ok(())
    }

    async fn open_session(&self) -> Result<Option<Arc<dyn MultipartSession>>, PartError> {
        let session: Arc<dyn MultipartSession> = match &self.config.multipart {
            None => return Ok(None),
            Some(MultipartGrant::BlockList { .. }) => Arc::new(SasBlockSession {
                target: self.clone(),
                upload_id: uuid::Uuid::new_v4().to_string(),
            }),
            Some(MultipartGrant::Presigned {
                upload_id,
                part_urls,
                complete_url,
                abort_url,
            }) => Arc::new(PresignedPartSession {
                client: self.client.clone(),
                upload_id: upload_id.clone(),
                part_urls: part_urls.clone(),
                complete_url: complete_url.clone(),
                abort_url: abort_url.clone(),
            }),
            Some(MultipartGrant::Session { .. }) => {
                return Err(PartError::fatal("in-process multipart session cannot be driven over HTTP"))
            }
        };
        Ok(Some(session))
    }

    fn session_preopened(&self) -> bool {
        matches!(self.config.multipart, Some(MultipartGrant::Presigned { .. }))
    }
}

#[async_trait]
impl RangeSource for PresignedHttpTarget {
    async fn read_range(&self, range: Option<Range<u64>>) -> Result<RangeChunk, PartError> {
        let mut req = self.client.get(self.config.authorization.url());
        if let Some(r) = &range {
            req = req.header(RANGE, range_header(r.start, r.end));
        }
        let resp = check_response(req.send().await?).await?;
        let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
        let total = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let data = resp.bytes().await?;
        let total_size = if partial { total } else { Some(data.len() as u64) };
        Ok(RangeChunk { data, total_size })
    }
}

/// S3-family session opened by the issuer; one signed URL per part
struct PresignedPartSession {
    client: reqwest::Client,
    upload_id: String,
    part_urls: Vec<String>,
    complete_url: String,
    abort_url: String,
}

#[async_trait]
impl MultipartSession for PresignedPartSession {
    fn upload_id(&self) -> &str {
        &self.upload_id
    }

    async fn upload_part(&self, part_number: u32, data: Bytes) -> Result<CompletedPart, PartError> {
        let url = part_number
            .checked_sub(1)
            .and_then(|i| self.part_urls.get(i as usize))
            .ok_or_else(|| PartError::fatal(format!("no signed URL for part {}", part_number)))?;
        let resp = check_response(self.client.put(url).body(data).send().await?).await?;
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PartError::retryable(format!("part {} response carried no ETag", part_number)))?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<(), PartError> {
        let body = complete_multipart_xml(&parts)?;
        let resp = check_response(self.client.post(&self.complete_url).body(body).send().await?).await?;
        // S3 may report a failed completion inside a 200 response
        let text = resp.text().await?;
        if text.contains("<Error>") {
            return Err(PartError::from_status(500, &text));
        }
        Ok(())
    }

    async fn abort(&self) -> Result<(), PartError> {
        let resp = self.client.delete(&self.abort_url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            // NoSuchUpload: already gone
            return Ok(());
        }
        check_response(resp).await?;
        Ok(())
    }
}

/// Azure block staging under the reusable SAS token
struct SasBlockSession {
    target: PresignedHttpTarget,
    upload_id: String,
}

#[async_trait]
impl MultipartSession for SasBlockSession {
    fn upload_id(&self) -> &str {
        &self.upload_id
    }

    async fn upload_part(&self, part_number: u32, data: Bytes) -> Result<CompletedPart, PartError> {
        let block_id = azure_block_id(part_number);
        let url = self
            .target
            .sas_url(&format!("comp=block&blockid={}", urlencoding::encode(&block_id)));
        check_response(self.target.client.put(url).body(data).send().await?).await?;
        Ok(CompletedPart {
            part_number,
            etag: block_id,
        })
    }

    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<(), PartError> {
        let body = block_list_xml(&parts)?;
        let url = self.target.sas_url("comp=blocklist");
        check_response(self.target.client.put(url).body(body).send().await?).await?;
        Ok(())
    }

    async fn abort(&self) -> Result<(), PartError> {
        // Uncommitted blocks are discarded by the service
        tracing::debug!("Block upload {} abandoned, staged blocks expire server-side", self.upload_id);
        Ok(())
    }
}

/// Frontend orchestrator / 前端传输编排器
#[derive(Clone, Default)]
pub struct TransferOrchestrator {
    client: reqwest::Client,
    progress: Option<ProgressCallback>,
}

impl TransferOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client, progress: None }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn upload_plan(&self, config: &TransferConfig) -> UploadPlan {
        let mut plan = UploadPlan::new(config.chunk_size, config.max_concurrency, config.retry);
        plan.max_parts = config.multipart.as_ref().map(|m| m.max_parts()).unwrap_or(1);
        plan.expires_at = Some(config.expires_at());
        plan.progress = self.progress.clone();
        plan
    }

    pub fn download_plan(&self, config: &TransferConfig) -> DownloadPlan {
        DownloadPlan {
            chunk_size: config.chunk_size,
            max_concurrency: config.max_concurrency,
            retry: config.retry,
            expires_at: Some(config.expires_at()),
        }
    }

    /// Upload with the grant's own HTTP endpoints / 上传
    pub async fn upload(
        &self,
        config: &TransferConfig,
        source: UploadSource,
        cancel: CancellationToken,
    ) -> Result<UploadReport, StorageError> {
        check_grant(config, Operation::Write)?;
        let target = PresignedHttpTarget::new(self.client.clone(), config)?;
        self.upload_via(config, &target, source, &cancel).await
    }

    /// Upload through a caller-supplied target / 通过指定目标上传
    pub async fn upload_via(
        &self,
        config: &TransferConfig,
        target: &dyn UploadTarget,
        source: UploadSource,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, StorageError> {
        check_grant(config, Operation::Write)?;
        let plan = self.upload_plan(config);
        tracing::info!(
            "Upload of {} started: chunk={} concurrency={}",
            config.reference,
            plan.chunk_size,
            plan.max_concurrency
        );
        let report = upload_source(target, &config.reference, source, &plan, cancel).await?;
        tracing::info!(
            "Upload of {} finished: {} bytes in {} parts",
            config.reference,
            report.bytes,
            report.parts
        );
        Ok(report)
    }

    /// Download with the grant's own HTTP endpoint / 下载
    pub async fn download(&self, config: &TransferConfig, mode: DownloadMode) -> Result<DownloadResult, StorageError> {
        check_grant(config, Operation::Read)?;
        let target = PresignedHttpTarget::new(self.client.clone(), config)?;
        self.download_via(config, Arc::new(target), mode).await
    }

    /// Download through a caller-supplied range source / 通过指定数据源下载
    pub async fn download_via(
        &self,
        config: &TransferConfig,
        source: Arc<dyn RangeSource>,
        mode: DownloadMode,
    ) -> Result<DownloadResult, StorageError> {
        check_grant(config, Operation::Read)?;
        download_ranges(source, &config.reference, &self.download_plan(config), mode).await
    }
}

fn check_grant(config: &TransferConfig, requested: Operation) -> Result<(), StorageError> {
    config.reference.validate()?;
    if config.operation() != requested {
        return Err(StorageError::OperationMismatch {
            granted: config.operation().as_str().to_string(),
            requested: requested.as_str().to_string(),
        });
    }
    config.authorization.ensure_valid()
}
