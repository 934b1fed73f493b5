//! Multipart engine shared by server-side drivers and the frontend orchestrator
//! 分片上传引擎（服务端驱动与前端编排器共用）
//!
//! - parts are read from the source only when a concurrency slot is free
//! - completion order is arbitrary, the manifest is always ascending
//! - any terminal failure or cancellation aborts the session

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{check_expiry, failure_to_error, ProgressCallback, RetryPolicy};
use crate::error::{PartError, StorageError};
use crate::reference::ObjectReference;

/// Receipt for an uploaded part / 已上传分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    /// ETag (S3 family) or block id (Azure) / 分片标识
    pub etag: String,
}

/// Provider-side multipart session / 分片会话
#[async_trait]
pub trait MultipartSession: Send + Sync {
    fn upload_id(&self) -> &str;

    /// Upload one part, `part_number` starts at 1
    async fn upload_part(&self, part_number: u32, data: Bytes) -> Result<CompletedPart, PartError>;

    /// Submit the manifest, ascending by part number
    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<(), PartError>;

    async fn abort(&self) -> Result<(), PartError>;
}

/// Parameters for one multipart run / 分片参数
#[derive(Clone)]
pub struct UploadPlan {
    pub chunk_size: u64,
    pub max_concurrency: usize,
    pub max_parts: usize,
    pub retry: RetryPolicy,
    pub expires_at: Option<DateTime<Utc>>,
    pub progress: Option<ProgressCallback>,
}

impl UploadPlan {
    pub fn new(chunk_size: u64, max_concurrency: usize, retry: RetryPolicy) -> Self {
        Self {
            chunk_size,
            max_concurrency,
            max_parts: usize::MAX,
            retry,
            expires_at: None,
            progress: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadReport {
    pub parts: usize,
    pub bytes: u64,
}

/// Aborts the session if dropped while still armed (future cancelled mid-flight)
struct AbortGuard {
    session: Option<Arc<dyn MultipartSession>>,
}

impl AbortGuard {
    fn new(session: Arc<dyn MultipartSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn disarm(&mut self) {
        self.session = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let upload_id = session.upload_id().to_string();
                    match session.abort().await {
                        Ok(()) => tracing::info!("Abandoned multipart session aborted: {}", upload_id),
                        Err(e) => tracing::error!("Abort of abandoned multipart session {} failed: {}", upload_id, e),
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    "Multipart session {} dropped outside a runtime, abort skipped",
                    session.upload_id()
                );
            }
        }
    }
}

enum Failure {
    Cancelled,
    Source(io::Error),
    TooManyParts(usize),
    Part { part_number: u32, error: PartError },
}

/// Upload pre-chunked parts through `session` and complete it / 上传分片并完成会话
///
/// Every non-success exit aborts the session. A failing abort is reported in
/// `TransferFailed::cleanup_error` next to the original error.
pub async fn upload_parts<S>(
    session: Arc<dyn MultipartSession>,
    reference: &ObjectReference,
    parts: S,
    plan: &UploadPlan,
    cancel: &CancellationToken,
) -> Result<UploadReport, StorageError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
{
    let mut guard = AbortGuard::new(session.clone());
    tracing::debug!("Multipart upload started: {} upload_id={}", reference, session.upload_id());

    let mut report = UploadReport::default();
    let outcome = drive(&session, parts, plan, cancel, &mut report).await;

    let completed = match outcome {
        Ok(completed) => completed,
        Err(failure) => {
            let cleanup = abort_session(session.as_ref()).await;
            guard.disarm();
            return Err(match failure {
                Failure::Cancelled => {
                    if let Some(c) = cleanup {
                        tracing::error!("Cancelled upload of {} left a session behind: {}", reference, c);
                    }
                    StorageError::Cancelled {
                        reference: reference.clone(),
                    }
                }
                Failure::Source(e) => StorageError::TransferFailed {
                    reference: reference.clone(),
                    part_number: None,
                    status: None,
                    last_error: format!("reading source failed: {}", e),
                    cleanup_error: cleanup,
                },
                Failure::TooManyParts(max) => StorageError::TransferFailed {
                    reference: reference.clone(),
                    part_number: Some(max as u32 + 1),
                    status: None,
                    last_error: format!("payload needs more than the {} parts granted", max),
                    cleanup_error: cleanup,
                },
                Failure::Part { part_number, error } => {
                    failure_to_error(reference, Some(part_number), error, cleanup, plan.expires_at)
                }
            });
        }
    };

    if completed.is_empty() {
        let cleanup = abort_session(session.as_ref()).await;
        guard.disarm();
        tracing::debug!("Multipart upload had no parts, session aborted: {}", reference);
        if let Some(c) = cleanup {
            tracing::warn!("Abort of empty session for {} failed: {}", reference, c);
        }
        return Ok(report);
    }

    let manifest_len = completed.len();
    let result = plan
        .retry
        .run("complete multipart upload", |_| {
            let manifest = completed.clone();
            let session = session.clone();
            async move {
                check_expiry(plan.expires_at)?;
                session.complete(manifest).await
            }
        })
        .await;

    match result {
        Ok(()) => {
            guard.disarm();
            tracing::info!(
                "Multipart upload completed: {} parts={} bytes={}",
                reference,
                manifest_len,
                report.bytes
            );
            Ok(report)
        }
        Err(error) => {
            let cleanup = abort_session(session.as_ref()).await;
            guard.disarm();
            Err(failure_to_error(reference, None, error, cleanup, plan.expires_at))
        }
    }
}

async fn drive<S>(
    session: &Arc<dyn MultipartSession>,
    mut parts: S,
    plan: &UploadPlan,
    cancel: &CancellationToken,
    report: &mut UploadReport,
) -> Result<Vec<CompletedPart>, Failure>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
{
    let concurrency = plan.max_concurrency.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut completed: Vec<CompletedPart> = Vec::new();
    let mut next_part: u32 = 1;
    let mut source_done = false;
    let mut done_bytes: u64 = 0;

    loop {
        // Fill free slots; the source is not polled while all slots are busy
        while !source_done && in_flight.len() < concurrency {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Failure::Cancelled),
                item = parts.next() => item,
            };
            match item {
                None => source_done = true,
                Some(Err(e)) => return Err(Failure::Source(e)),
                Some(Ok(data)) => {
                    if next_part as usize > plan.max_parts {
                        return Err(Failure::TooManyParts(plan.max_parts));
                    }
                    report.bytes += data.len() as u64;
                    in_flight.push(upload_one(
                        session.clone(),
                        next_part,
                        data,
                        plan.retry,
                        plan.expires_at,
                    ));
                    next_part += 1;
                }
            }
        }

        if in_flight.is_empty() {
            break;
        }

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Failure::Cancelled),
            finished = in_flight.next() => finished,
        };
        match finished {
            Some(Ok((part, len))) => {
                done_bytes += len;
                if let Some(progress) = &plan.progress {
                    progress(done_bytes, report.bytes);
                }
                completed.push(part);
            }
            Some(Err((part_number, error))) => return Err(Failure::Part { part_number, error }),
            None => {}
        }
    }

    completed.sort_by_key(|p| p.part_number);
    report.parts = completed.len();
    Ok(completed)
}

async fn upload_one(
    session: Arc<dyn MultipartSession>,
    part_number: u32,
    data: Bytes,
    retry: RetryPolicy,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(CompletedPart, u64), (u32, PartError)> {
    let len = data.len() as u64;
    let what = format!("upload part {}", part_number);
    retry
        .run(&what, |attempt| {
            let session = session.clone();
            let data = data.clone();
            async move {
                check_expiry(expires_at)?;
                tracing::debug!("Uploading part {} ({} bytes, attempt {})", part_number, data.len(), attempt);
                session.upload_part(part_number, data).await
            }
        })
        .await
        .map(|part| (part, len))
        .map_err(|e| (part_number, e))
}

/// Abort and return the abort error text if it failed / 取消会话
async fn abort_session(session: &dyn MultipartSession) -> Option<String> {
    match session.abort().await {
        Ok(()) => {
            tracing::info!("Multipart session aborted: {}", session.upload_id());
            None
        }
        Err(e) => {
            tracing::error!("Abort of multipart session {} failed: {}", session.upload_id(), e);
            Some(e.to_string())
        }
    }
}
