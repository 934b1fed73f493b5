//! Transfer layer / 传输层
//!
//! The pieces both sides of the trust boundary share: retry policy, the
//! multipart engine, ranged downloads. The frontend orchestrator drives them
//! from a `TransferConfig`; server-side drivers drive them with their own
//! provider clients.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use futures::Stream;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::error::{PartError, PartErrorKind, StorageError};
use crate::reference::ObjectReference;

pub mod download;
pub mod multipart;
pub mod orchestrator;
pub mod retry;
pub mod wire;

pub use download::{download_ranges, DownloadMode, DownloadPlan, DownloadResult, DownloadStream, RangeChunk, RangeSource};
pub use multipart::{upload_parts, CompletedPart, MultipartSession, UploadPlan, UploadReport};
pub use orchestrator::{PresignedHttpTarget, TransferOrchestrator};
pub use retry::RetryPolicy;

/// 进度回调类型 / Progress callback type
/// 参数: (已完成字节数, 已读取字节数) / Parameters: (completed_bytes, read_bytes)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Payload of an upload: a materialized buffer or a single-pass byte stream
/// 上传数据源：内存缓冲或字节流
pub enum UploadSource {
    Buffer(Bytes),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl UploadSource {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        UploadSource::Stream(ReaderStream::new(reader).boxed())
    }

    /// Cut the source into parts of exactly `chunk_size` bytes (last one may be shorter)
    pub fn into_parts(self, chunk_size: u64) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            UploadSource::Buffer(data) => buffer_parts(data, chunk_size).boxed(),
            UploadSource::Stream(s) => chunk_stream(s, chunk_size).boxed(),
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(data: Bytes) -> Self {
        UploadSource::Buffer(data)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(data: Vec<u8>) -> Self {
        UploadSource::Buffer(Bytes::from(data))
    }
}

/// Zero-copy slices of a buffer / 缓冲区切片
pub fn buffer_parts(data: Bytes, chunk_size: u64) -> impl Stream<Item = io::Result<Bytes>> + Unpin + Send {
    let chunk = chunk_size.max(1) as usize;
    let count = data.len().div_ceil(chunk);
    stream::iter((0..count).map(move |i| {
        let start = i * chunk;
        let end = (start + chunk).min(data.len());
        Ok(data.slice(start..end))
    }))
}

/// Re-chunk an arbitrary byte stream into fixed-size parts / 流重新分片
pub fn chunk_stream<S>(source: S, chunk_size: u64) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
{
    let chunk = chunk_size.max(1) as usize;
    stream::unfold(
        (source, BytesMut::with_capacity(chunk), false),
        move |(mut source, mut buffer, mut finished)| async move {
            loop {
                if buffer.len() >= chunk {
                    let part = buffer.split_to(chunk).freeze();
                    return Some((Ok(part), (source, buffer, finished)));
                }
                if finished {
                    if buffer.is_empty() {
                        return None;
                    }
                    let part = buffer.split().freeze();
                    return Some((Ok(part), (source, buffer, finished)));
                }
                match source.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        // Surface the error once, then end the stream
                        buffer.clear();
                        return Some((Err(e), (source, buffer, true)));
                    }
                    None => finished = true,
                }
            }
        },
    )
}

/// Destination of an upload / 上传目标
#[async_trait]
pub trait UploadTarget: Send + Sync {
    /// Single-request upload / 单次上传
    async fn put_single(&self, data: Bytes) -> Result<(), PartError>;

    /// Open (or adopt) a multipart session. `None` when the target cannot split uploads.
    async fn open_session(&self) -> Result<Option<Arc<dyn MultipartSession>>, PartError>;

    /// The provider session already exists before the first byte is read
    /// (initiated by the issuer). It must be completed or aborted on every exit.
    fn session_preopened(&self) -> bool {
        false
    }
}

/// Upload a source through a target: one request when it fits in one chunk,
/// otherwise the multipart engine / 上传数据源
pub async fn upload_source(
    target: &dyn UploadTarget,
    reference: &ObjectReference,
    source: UploadSource,
    plan: &UploadPlan,
    cancel: &CancellationToken,
) -> Result<UploadReport, StorageError> {
    if target.session_preopened() {
        return upload_adopted(target, reference, source, plan, cancel).await;
    }

    let mut parts = source.into_parts(plan.chunk_size);

    let first = match next_part(&mut parts, reference, cancel).await? {
        Some(first) => first,
        None => Bytes::new(),
    };
    let second = if first.len() as u64 >= plan.chunk_size {
        next_part(&mut parts, reference, cancel).await?
    } else {
        None
    };

    let Some(second) = second else {
        let len = first.len() as u64;
        put_single_with_retry(target, reference, first, plan, cancel).await?;
        if let Some(progress) = &plan.progress {
            progress(len, len);
        }
        return Ok(UploadReport { parts: 1, bytes: len });
    };

    let Some(session) = open_session_with_retry(target, reference, plan).await? else {
        return Err(StorageError::TransferFailed {
            reference: reference.clone(),
            part_number: Some(2),
            status: None,
            last_error: format!(
                "payload is larger than one {} byte chunk but the grant allows no multipart upload",
                plan.chunk_size
            ),
            cleanup_error: None,
        });
    };

    let all = stream::iter(vec![Ok::<_, io::Error>(first), Ok(second)]).chain(parts);
    upload_parts(session, reference, all, plan, cancel).await
}

/// Every byte goes through the already-open session so the engine's abort
/// guard covers cancellation, source errors and drops from the first read on.
/// A small payload becomes part 1 plus complete.
async fn upload_adopted(
    target: &dyn UploadTarget,
    reference: &ObjectReference,
    source: UploadSource,
    plan: &UploadPlan,
    cancel: &CancellationToken,
) -> Result<UploadReport, StorageError> {
    let Some(session) = open_session_with_retry(target, reference, plan).await? else {
        return Err(StorageError::TransferFailed {
            reference: reference.clone(),
            part_number: None,
            status: None,
            last_error: "target reported an open multipart session but returned none".to_string(),
            cleanup_error: None,
        });
    };
    let report = upload_parts(session, reference, source.into_parts(plan.chunk_size), plan, cancel).await?;
    if report.parts > 0 {
        return Ok(report);
    }

    // Empty payload: the engine aborted the session, store a zero-length object
    put_single_with_retry(target, reference, Bytes::new(), plan, cancel).await?;
    if let Some(progress) = &plan.progress {
        progress(0, 0);
    }
    Ok(UploadReport { parts: 1, bytes: 0 })
}

async fn open_session_with_retry(
    target: &dyn UploadTarget,
    reference: &ObjectReference,
    plan: &UploadPlan,
) -> Result<Option<Arc<dyn MultipartSession>>, StorageError> {
    plan.retry
        .run("open multipart session", move |_| async move {
            check_expiry(plan.expires_at)?;
            target.open_session().await
        })
        .await
        .map_err(|e| failure_to_error(reference, None, e, None, plan.expires_at))
}

async fn next_part(
    parts: &mut BoxStream<'static, io::Result<Bytes>>,
    reference: &ObjectReference,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>, StorageError> {
    let item = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(StorageError::Cancelled { reference: reference.clone() }),
        item = parts.next() => item,
    };
    item.transpose().map_err(|e| StorageError::TransferFailed {
        reference: reference.clone(),
        part_number: None,
        status: None,
        last_error: format!("reading source failed: {}", e),
        cleanup_error: None,
    })
}

async fn put_single_with_retry(
    target: &dyn UploadTarget,
    reference: &ObjectReference,
    data: Bytes,
    plan: &UploadPlan,
    cancel: &CancellationToken,
) -> Result<(), StorageError> {
    let put = plan.retry.run("single upload", |_| {
        let data = data.clone();
        async move {
            check_expiry(plan.expires_at)?;
            target.put_single(data).await
        }
    });
    // Abandoning a single request needs no provider-side cleanup
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled { reference: reference.clone() }),
        result = put => result.map_err(|e| failure_to_error(reference, None, e, None, plan.expires_at)),
    }
}

/// Local expiry check before each provider request / 请求前检查授权是否过期
pub(crate) fn check_expiry(expires_at: Option<DateTime<Utc>>) -> Result<(), PartError> {
    if let Some(expires_at) = expires_at {
        if Utc::now() >= expires_at {
            return Err(PartError {
                status: None,
                message: format!("authorization expired at {}", expires_at),
                kind: PartErrorKind::Expired,
            });
        }
    }
    Ok(())
}

/// Map the last request error to the caller-facing taxonomy / 错误映射
pub(crate) fn failure_to_error(
    reference: &ObjectReference,
    part_number: Option<u32>,
    error: PartError,
    cleanup_error: Option<String>,
    expires_at: Option<DateTime<Utc>>,
) -> StorageError {
    if error.kind == PartErrorKind::Expired {
        if let Some(c) = cleanup_error {
            tracing::warn!("Cleanup after expired grant for {} failed: {}", reference, c);
        }
        return StorageError::ExpiredAuthorization {
            expired_at: expires_at.unwrap_or_else(Utc::now),
        };
    }
    StorageError::TransferFailed {
        reference: reference.clone(),
        part_number,
        status: error.status,
        last_error: error.message,
        cleanup_error,
    }
}

#[cfg(test)]
mod tests {
    use super::multipart::tests::RecordingSession;
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn collect(parts: Vec<io::Result<Bytes>>) -> Vec<usize> {
        parts.into_iter().map(|p| p.unwrap().len()).collect()
    }

    #[tokio::test]
    async fn test_buffer_parts() {
        let parts: Vec<_> = buffer_parts(Bytes::from(vec![0u8; 10]), 4).collect().await;
        assert_eq!(collect(parts), vec![4, 4, 2]);

        let parts: Vec<_> = buffer_parts(Bytes::new(), 4).collect().await;
        assert!(parts.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_stream_regroups() {
        let input = stream::iter(vec![
            Ok(Bytes::from(vec![1u8; 3])),
            Ok(Bytes::from(vec![2u8; 6])),
            Ok(Bytes::from(vec![3u8; 1])),
        ]);
        let parts: Vec<_> = chunk_stream(input, 4).collect().await;
        assert_eq!(collect(parts), vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_chunk_stream_error() {
        let input = stream::iter(vec![
            Ok(Bytes::from(vec![1u8; 3])),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "cut")),
        ]);
        let parts: Vec<_> = chunk_stream(input, 4).collect().await;
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_err());
    }

    struct FakeTarget {
        single: Mutex<Vec<Bytes>>,
        session: Option<Arc<RecordingSession>>,
        preopened: bool,
    }

    impl FakeTarget {
        fn new(session: Option<Arc<RecordingSession>>) -> Self {
            Self {
                single: Mutex::new(Vec::new()),
                session,
                preopened: false,
            }
        }

        /// Session initiated by the issuer before the upload starts
        fn adopting(session: Arc<RecordingSession>) -> Self {
            Self {
                preopened: true,
                ..Self::new(Some(session))
            }
        }
    }

    #[async_trait]
    impl UploadTarget for FakeTarget {
        async fn put_single(&self, data: Bytes) -> Result<(), PartError> {
            self.single.lock().push(data);
            Ok(())
        }

        async fn open_session(&self) -> Result<Option<Arc<dyn MultipartSession>>, PartError> {
            Ok(self
                .session
                .clone()
                .map(|s| s as Arc<dyn MultipartSession>))
        }

        fn session_preopened(&self) -> bool {
            self.preopened
        }
    }

    fn plan(chunk: u64) -> UploadPlan {
        UploadPlan::new(chunk, 2, RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn test_small_payload_is_single_request() {
        let session = Arc::new(RecordingSession::default());
        let target = FakeTarget::new(Some(session.clone()));
        let reference = ObjectReference::new("c", "", "f");

        let report = upload_source(
            &target,
            &reference,
            UploadSource::from(vec![7u8; 4]),
            &plan(4),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report, UploadReport { parts: 1, bytes: 4 });
        assert_eq!(target.single.lock().len(), 1);
        assert!(session.parts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stream_payload_goes_multipart() {
        let session = Arc::new(RecordingSession::default());
        let target = FakeTarget::new(Some(session.clone()));
        let data: Vec<u8> = (0..10u8).collect();
        let source = UploadSource::Stream(
            stream::iter(data.chunks(3).map(|c| Ok(Bytes::copy_from_slice(c))).collect::<Vec<_>>()).boxed(),
        );

        let report = upload_source(
            &target,
            &ObjectReference::new("c", "", "f"),
            source,
            &plan(4),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.parts, 3);
        assert!(target.single.lock().is_empty());
        assert_eq!(session.assembled(), Bytes::from(data));
    }

    #[tokio::test]
    async fn test_large_payload_without_multipart_grant() {
        let target = FakeTarget::new(None);
        let err = upload_source(
            &target,
            &ObjectReference::new("c", "", "f"),
            UploadSource::from(vec![0u8; 9]),
            &plan(4),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::TransferFailed { .. }));
        assert!(target.single.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let target = FakeTarget::new(None);
        let report = upload_source(
            &target,
            &ObjectReference::new("c", "", "f"),
            UploadSource::from(Vec::new()),
            &plan(4),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.bytes, 0);
        assert_eq!(target.single.lock()[0].len(), 0);
    }

    #[tokio::test]
    async fn test_small_payload_finishes_adopted_session() {
        let session = Arc::new(RecordingSession::default());
        let target = FakeTarget::adopting(session.clone());

        let report = upload_source(
            &target,
            &ObjectReference::new("c", "", "f"),
            UploadSource::from(vec![7u8; 3]),
            &plan(4),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report, UploadReport { parts: 1, bytes: 3 });
        assert!(target.single.lock().is_empty());
        assert_eq!(*session.manifests.lock(), vec![vec![1]]);
        assert_eq!(session.aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_payload_aborts_adopted_session() {
        let session = Arc::new(RecordingSession::default());
        let target = FakeTarget::adopting(session.clone());

        let report = upload_source(
            &target,
            &ObjectReference::new("c", "", "f"),
            UploadSource::from(Vec::new()),
            &plan(4),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report, UploadReport { parts: 1, bytes: 0 });
        assert_eq!(session.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(target.single.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_first_read_aborts_adopted_session() {
        let session = Arc::new(RecordingSession::default());
        let target = FakeTarget::adopting(session.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = upload_source(
            &target,
            &ObjectReference::new("c", "", "f"),
            UploadSource::from(vec![1u8; 10]),
            &plan(4),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Cancelled { .. }));
        assert_eq!(session.aborts.load(Ordering::SeqCst), 1);
        assert!(session.parts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_source_error_aborts_adopted_session() {
        let session = Arc::new(RecordingSession::default());
        let target = FakeTarget::adopting(session.clone());
        let source = UploadSource::Stream(
            stream::iter(vec![
                Ok(Bytes::from(vec![1u8; 2])),
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "source went away")),
            ])
            .boxed(),
        );

        let err = upload_source(
            &target,
            &ObjectReference::new("c", "", "f"),
            source,
            &plan(4),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            StorageError::TransferFailed { last_error, .. } => assert!(last_error.contains("source went away")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.aborts.load(Ordering::SeqCst), 1);
        assert!(session.manifests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_upload_aborts_adopted_session() {
        let session = Arc::new(RecordingSession::default());
        let target = FakeTarget::adopting(session.clone());
        let reference = ObjectReference::new("c", "", "f");
        let upload_plan = plan(4);
        let cancel = CancellationToken::new();

        // A source that never yields its first part
        let fut = upload_source(
            &target,
            &reference,
            UploadSource::Stream(stream::pending::<io::Result<Bytes>>().boxed()),
            &upload_plan,
            &cancel,
        );
        assert!(tokio::time::timeout(Duration::from_millis(10), fut).await.is_err());

        for _ in 0..50 {
            if session.aborts.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(session.aborts.load(Ordering::SeqCst), 1);
    }
}
