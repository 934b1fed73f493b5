//! In-memory provider / 内存存储提供方
//!
//! Local development and tests. Objects live in a map, multipart sessions are
//! tracked so an abandoned upload is observable, and grants are HMAC-signed
//! with a per-process secret and redeemed through `MemoryProvider::target`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration as ChronoDuration;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    now_seconds, validate_ttl, MultipartGrant, ObjectStore, Operation, PresignIssuer, PresignedAuthorization,
    ProviderBundle, ProviderFactory, ProviderInfo, ProviderKind, SignatureArtifact, TransferConfig,
    TransferConfigProvider, MIB,
};
use crate::error::{BindingError, PartError, StorageError};
use crate::reference::{ObjectPrefix, ObjectReference};
use crate::sign::{encode_path, hmac_sha256};
use crate::transfer::{
    buffer_parts, upload_parts, CompletedPart, MultipartSession, RangeChunk, RangeSource, RetryPolicy, UploadPlan,
    UploadTarget,
};

const MAX_TTL_SECS: u64 = 7 * 24 * 3600;

/// 内存提供方配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Part size in bytes, also the multipart threshold / 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    /// Default grant validity in hours / 签名有效期（小时）
    #[serde(default = "default_sign_expire")]
    pub sign_url_expire: u32,
}

fn default_chunk_size() -> u64 {
    5 * MIB
}

fn default_concurrency() -> usize {
    4
}

fn default_sign_expire() -> u32 {
    4
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrency: default_concurrency(),
            sign_url_expire: default_sign_expire(),
        }
    }
}

struct OpenSession {
    object: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct MemoryState {
    objects: RwLock<HashMap<String, Bytes>>,
    sessions: Mutex<HashMap<String, OpenSession>>,
    /// Provider-side operations performed
    calls: AtomicUsize,
}

impl MemoryState {
    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn open_session(&self, upload_id: &str, object: String) -> Result<(), PartError> {
        self.touch();
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(upload_id) {
            return Err(PartError::from_status(409, "upload id already in use"));
        }
        sessions.insert(
            upload_id.to_string(),
            OpenSession {
                object,
                parts: BTreeMap::new(),
            },
        );
        Ok(())
    }
}

/// Object location inside the map: `base/key`
fn storage_key(reference: &ObjectReference) -> Result<String, StorageError> {
    Ok(format!("{}/{}", reference.base_directory, reference.key()?))
}

/// 内存存储提供方
pub struct MemoryProvider {
    config: MemoryConfig,
    state: Arc<MemoryState>,
    secret: [u8; 32],
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: Arc::new(MemoryState::default()),
            secret: rand::random(),
        }
    }

    /// Provider-side calls performed so far / 已执行的存储操作次数
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Multipart sessions neither completed nor aborted / 未结束的分片会话数
    pub fn open_sessions(&self) -> usize {
        self.state.sessions.lock().len()
    }

    fn locator(reference: &ObjectReference) -> Result<String, StorageError> {
        Ok(format!(
            "memory://{}/{}",
            reference.base_directory,
            encode_path(&reference.key()?)
        ))
    }

    fn sign(&self, permission: &str, locator: &str, expires: i64) -> Result<String, StorageError> {
        let payload = format!("{}\n{}\n{}", permission, locator, expires);
        Ok(hex::encode(hmac_sha256(&self.secret, payload.as_bytes())?))
    }

    fn session(&self, upload_id: String) -> Arc<dyn MultipartSession> {
        Arc::new(MemorySession {
            state: self.state.clone(),
            upload_id,
        })
    }

    /// Check a grant issued by this provider / 校验授权
    pub fn verify(&self, authorization: &PresignedAuthorization) -> Result<(), StorageError> {
        authorization.ensure_valid()?;
        let expected = self.sign(
            &authorization.permission,
            &authorization.locator,
            authorization.expires_at.timestamp(),
        )?;
        let query = authorization.signature.as_query();
        let presented = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("signature="))
            .unwrap_or_default();
        if presented != expected || authorization.permission != authorization.operation.as_str() {
            return Err(StorageError::Signing("memory grant signature mismatch".to_string()));
        }
        Ok(())
    }

    /// Redeem a transfer config against this provider / 以传输配置访问内存存储
    pub fn target(&self, config: &TransferConfig) -> Result<MemoryTransferTarget, StorageError> {
        self.verify(&config.authorization)?;
        if config.authorization.locator != Self::locator(&config.reference)? {
            return Err(StorageError::Signing("grant does not cover this object".to_string()));
        }
        let upload_id = match &config.multipart {
            Some(MultipartGrant::Session { upload_id }) => Some(upload_id.clone()),
            _ => None,
        };
        Ok(MemoryTransferTarget {
            state: self.state.clone(),
            object: storage_key(&config.reference)?,
            operation: config.operation(),
            upload_id,
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::Memory,
            chunk_size: self.config.chunk_size.max(1),
            min_part_size: 1,
            max_parts: 10_000,
            max_concurrency: self.config.max_concurrency.max(1),
            max_ttl: Duration::from_secs(MAX_TTL_SECS),
        }
    }

    async fn upload(&self, reference: &ObjectReference, payload: Bytes) -> Result<(), StorageError> {
        let object = storage_key(reference)?;
        let info = self.info();
        let (chunk, _) = info.plan_parts(payload.len() as u64);

        if payload.len() as u64 <= chunk {
            self.state.touch();
            self.state.objects.write().insert(object, payload);
            return Ok(());
        }

        let upload_id = uuid::Uuid::new_v4().to_string();
        self.state
            .open_session(&upload_id, object)
            .map_err(|e| StorageError::provider(e.message))?;
        let mut plan = UploadPlan::new(chunk, info.max_concurrency, RetryPolicy::default());
        plan.max_parts = info.max_parts;
        upload_parts(
            self.session(upload_id),
            reference,
            buffer_parts(payload, chunk),
            &plan,
            &CancellationToken::new(),
        )
        .await?;
        Ok(())
    }

    async fn download(&self, reference: &ObjectReference) -> Result<Bytes, StorageError> {
        let object = storage_key(reference)?;
        self.state.touch();
        self.state
            .objects
            .read()
            .get(&object)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }

    async fn delete(&self, reference: &ObjectReference) -> Result<(), StorageError> {
        let object = storage_key(reference)?;
        self.state.touch();
        self.state.objects.write().remove(&object);
        Ok(())
    }

    async fn list(&self, prefix: &ObjectPrefix) -> Result<Vec<ObjectReference>, StorageError> {
        let key_prefix = format!("{}/{}", prefix.base_directory, prefix.key_prefix()?);
        let base_len = prefix.base_directory.len() + 1;
        self.state.touch();
        let objects = self.state.objects.read();
        let mut found: Vec<ObjectReference> = objects
            .keys()
            .filter(|k| k.starts_with(&key_prefix))
            .filter_map(|k| ObjectReference::from_key(&prefix.base_directory, &k[base_len..]))
            .collect();
        found.sort_by_key(|r| r.to_string());
        Ok(found)
    }

    async fn exists(&self, reference: &ObjectReference) -> Result<bool, StorageError> {
        let object = storage_key(reference)?;
        self.state.touch();
        Ok(self.state.objects.read().contains_key(&object))
    }
}

impl PresignIssuer for MemoryProvider {
    fn max_ttl(&self) -> Duration {
        Duration::from_secs(MAX_TTL_SECS)
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
        let locator = Self::locator(reference)?;
        let permission = operation.as_str().to_string();
        let signature = self.sign(&permission, &locator, expires_at.timestamp())?;

        Ok(PresignedAuthorization {
            operation,
            locator,
            permission,
            issued_at,
            expires_at,
            signature: SignatureArtifact::QueryString(format!(
                "expires={}&signature={}",
                expires_at.timestamp(),
                signature
            )),
        })
    }
}

#[async_trait]
impl TransferConfigProvider for MemoryProvider {
    async fn get_config(&self, reference: &ObjectReference, operation: Operation) -> Result<TransferConfig, StorageError> {
        let ttl = Duration::from_secs(self.config.sign_url_expire.max(1) as u64 * 3600);
        let authorization = self.issue(reference, operation, ttl.min(self.max_ttl()))?;
        // the session is registered when the holder first needs it
        let multipart = match operation {
            Operation::Write => Some(MultipartGrant::Session {
                upload_id: uuid::Uuid::new_v4().to_string(),
            }),
            Operation::Read => None,
        };
        let info = self.info();
        Ok(TransferConfig {
            reference: reference.clone(),
            authorization,
            chunk_size: info.chunk_size,
            max_concurrency: info.max_concurrency,
            retry: RetryPolicy::default(),
            multipart,
        })
    }
}

struct MemorySession {
    state: Arc<MemoryState>,
    upload_id: String,
}

#[async_trait]
impl MultipartSession for MemorySession {
    fn upload_id(&self) -> &str {
        &self.upload_id
    }

    async fn upload_part(&self, part_number: u32, data: Bytes) -> Result<CompletedPart, PartError> {
        self.state.touch();
        let mut sessions = self.state.sessions.lock();
        let session = sessions
            .get_mut(&self.upload_id)
            .ok_or_else(|| PartError::from_status(404, "NoSuchUpload"))?;
        session.parts.insert(part_number, data);
        Ok(CompletedPart {
            part_number,
            etag: format!("\"{}-{}\"", self.upload_id, part_number),
        })
    }

    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<(), PartError> {
        self.state.touch();
        let session = self
            .state
            .sessions
            .lock()
            .remove(&self.upload_id)
            .ok_or_else(|| PartError::from_status(404, "NoSuchUpload"))?;

        let mut assembled = Vec::new();
        let mut last = 0;
        for part in &parts {
            if part.part_number <= last {
                return Err(PartError::from_status(400, "InvalidPartOrder"));
            }
            last = part.part_number;
            let data = session
                .parts
                .get(&part.part_number)
                .ok_or_else(|| PartError::from_status(400, "InvalidPart"))?;
            assembled.extend_from_slice(data);
        }
        self.state.objects.write().insert(session.object, Bytes::from(assembled));
        Ok(())
    }

    async fn abort(&self) -> Result<(), PartError> {
        self.state.touch();
        self.state.sessions.lock().remove(&self.upload_id);
        Ok(())
    }
}

/// A redeemed grant: upload target and range source for one object
pub struct MemoryTransferTarget {
    state: Arc<MemoryState>,
    object: String,
    operation: Operation,
    upload_id: Option<String>,
}

impl MemoryTransferTarget {
    fn require(&self, operation: Operation) -> Result<(), PartError> {
        if self.operation != operation {
            return Err(PartError::from_status(403, "operation not permitted by grant"));
        }
        Ok(())
    }
}

#[async_trait]
impl UploadTarget for MemoryTransferTarget {
    async fn put_single(&self, data: Bytes) -> Result<(), PartError> {
        self.require(Operation::Write)?;
        self.state.touch();
        self.state.objects.write().insert(self.object.clone(), data);
        Ok(())
    }

    async fn open_session(&self) -> Result<Option<Arc<dyn MultipartSession>>, PartError> {
        self.require(Operation::Write)?;
        let Some(upload_id) = &self.upload_id else {
            return Ok(None);
        };
        self.state.open_session(upload_id, self.object.clone())?;
        Ok(Some(Arc::new(MemorySession {
            state: self.state.clone(),
            upload_id: upload_id.clone(),
        })))
    }
}

#[async_trait]
impl RangeSource for MemoryTransferTarget {
    async fn read_range(&self, range: Option<Range<u64>>) -> Result<RangeChunk, PartError> {
        self.require(Operation::Read)?;
        self.state.touch();
        let data = self
            .state
            .objects
            .read()
            .get(&self.object)
            .cloned()
            .ok_or_else(|| PartError::from_status(404, "NoSuchKey"))?;
        let len = data.len() as u64;
        match range {
            None => Ok(RangeChunk {
                total_size: Some(len),
                data,
            }),
            Some(r) if r.start >= len => Err(PartError::from_status(416, "InvalidRange")),
            Some(r) => Ok(RangeChunk {
                data: data.slice(r.start as usize..r.end.min(len) as usize),
                total_size: Some(len),
            }),
        }
    }
}

/// 内存提供方工厂
pub struct MemoryProviderFactory;

impl ProviderFactory for MemoryProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    fn create(&self, settings: Value) -> Result<ProviderBundle, StorageError> {
        let config: MemoryConfig = serde_json::from_value(settings).map_err(|e| BindingError::InvalidSettings {
            provider: "memory".to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(
            "Memory provider initialized, chunk={} concurrency={}",
            config.chunk_size,
            config.max_concurrency
        );
        Ok(ProviderBundle::from_driver(
            ProviderKind::Memory,
            Arc::new(MemoryProvider::new(config)),
        ))
    }
}
