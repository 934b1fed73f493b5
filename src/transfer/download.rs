//! Ranged downloads / 分段下载
//!
//! The first ranged request learns the object size from `Content-Range`;
//! the remaining ranges are fetched with bounded concurrency. A stream result
//! is fed through a one-slot channel, so no further range is requested while
//! the consumer has not drained what is already buffered.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{check_expiry, failure_to_error, RetryPolicy};
use crate::error::{PartError, StorageError};
use crate::reference::ObjectReference;

/// One ranged response / 分段响应
#[derive(Debug, Clone)]
pub struct RangeChunk {
    pub data: Bytes,
    /// Full object size: the `Content-Range` total of a partial response, or
    /// the body length of a whole-object response. `None` when a partial
    /// response withheld it (`bytes 0-N/*`).
    pub total_size: Option<u64>,
}

/// Something that can serve byte ranges of one object / 可按范围读取的对象
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// `None` requests the whole object; ranges are half-open
    async fn read_range(&self, range: Option<Range<u64>>) -> Result<RangeChunk, PartError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Buffer,
    Stream,
}

/// Download result chosen by the caller at request time / 下载结果
pub enum DownloadResult {
    Buffer(Bytes),
    Stream(DownloadStream),
}

impl DownloadResult {
    /// Materialize either variant / 读取全部数据
    pub async fn into_bytes(self) -> Result<Bytes, StorageError> {
        match self {
            DownloadResult::Buffer(data) => Ok(data),
            DownloadResult::Stream(mut s) => {
                let mut buf = BytesMut::with_capacity(s.total_size() as usize);
                while let Some(chunk) = s.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

/// Finite, single-pass, back-pressured byte stream / 单次消费的下载流
pub struct DownloadStream {
    inner: ReceiverStream<Result<Bytes, StorageError>>,
    total_size: u64,
}

impl DownloadStream {
    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

impl Stream for DownloadStream {
    type Item = Result<Bytes, StorageError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub chunk_size: u64,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Download an object range by range / 分段下载对象
pub async fn download_ranges(
    source: Arc<dyn RangeSource>,
    reference: &ObjectReference,
    plan: &DownloadPlan,
    mode: DownloadMode,
) -> Result<DownloadResult, StorageError> {
    let chunk = plan.chunk_size.max(1);

    let first = match fetch(source.clone(), Some(0..chunk), plan.retry, plan.expires_at).await {
        Ok(first) => first,
        // Range on an empty object
        Err(e) if e.status == Some(416) => RangeChunk {
            data: Bytes::new(),
            total_size: Some(0),
        },
        Err(e) => return Err(failure_to_error(reference, Some(1), e, None, plan.expires_at)),
    };

    let first_len = first.data.len() as u64;
    let Some(total) = first.total_size else {
        return Err(StorageError::TransferFailed {
            reference: reference.clone(),
            part_number: Some(1),
            status: Some(206),
            last_error: "partial response did not report the object size".to_string(),
            cleanup_error: None,
        });
    };
    let ranges: Vec<Range<u64>> = (first_len..total)
        .step_by(chunk as usize)
        .map(|start| start..(start + chunk).min(total))
        .collect();

    tracing::debug!(
        "Download of {}: size={} ranges={} mode={:?}",
        reference,
        total,
        ranges.len() + 1,
        mode
    );

    let rest = remaining_ranges(source, reference.clone(), ranges, plan);

    match mode {
        DownloadMode::Buffer => {
            let mut buf = BytesMut::with_capacity(total as usize);
            buf.extend_from_slice(&first.data);
            let mut rest = rest;
            while let Some(item) = rest.next().await {
                buf.extend_from_slice(&item?);
            }
            if buf.len() as u64 != total {
                return Err(StorageError::TransferFailed {
                    reference: reference.clone(),
                    part_number: None,
                    status: None,
                    last_error: format!("expected {} bytes, received {}", total, buf.len()),
                    cleanup_error: None,
                });
            }
            Ok(DownloadResult::Buffer(buf.freeze()))
        }
        DownloadMode::Stream => {
            let (tx, rx) = mpsc::channel::<Result<Bytes, StorageError>>(1);
            let name = reference.to_string();
            tokio::spawn(async move {
                if !first.data.is_empty() && tx.send(Ok(first.data)).await.is_err() {
                    return;
                }
                let mut rest = rest;
                while let Some(item) = rest.next().await {
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() {
                        tracing::debug!("Download stream of {} dropped by consumer", name);
                        return;
                    }
                    if failed {
                        return;
                    }
                }
            });
            Ok(DownloadResult::Stream(DownloadStream {
                inner: ReceiverStream::new(rx),
                total_size: total,
            }))
        }
    }
}

fn remaining_ranges(
    source: Arc<dyn RangeSource>,
    reference: ObjectReference,
    ranges: Vec<Range<u64>>,
    plan: &DownloadPlan,
) -> BoxStream<'static, Result<Bytes, StorageError>> {
    let retry = plan.retry;
    let expires_at = plan.expires_at;
    stream::iter(ranges.into_iter().enumerate())
        .map(move |(i, range)| {
            let source = source.clone();
            let reference = reference.clone();
            async move {
                let part_number = i as u32 + 2;
                let expected = range.end - range.start;
                let chunk = fetch(source, Some(range), retry, expires_at)
                    .await
                    .map_err(|e| failure_to_error(&reference, Some(part_number), e, None, expires_at))?;
                if chunk.data.len() as u64 != expected {
                    return Err(StorageError::TransferFailed {
                        reference,
                        part_number: Some(part_number),
                        status: None,
                        last_error: format!("range returned {} bytes, expected {}", chunk.data.len(), expected),
                        cleanup_error: None,
                    });
                }
                Ok(chunk.data)
            }
        })
        .buffered(plan.max_concurrency.max(1))
        .boxed()
}

async fn fetch(
    source: Arc<dyn RangeSource>,
    range: Option<Range<u64>>,
    retry: RetryPolicy,
    expires_at: Option<DateTime<Utc>>,
) -> Result<RangeChunk, PartError> {
    retry
        .run("range read", |_| {
            let source = source.clone();
            let range = range.clone();
            async move {
                check_expiry(expires_at)?;
                source.read_range(range).await
            }
        })
        .await
}
