//! HTTP wire helpers shared by the orchestrator and the reqwest-based drivers
//! HTTP 协议辅助

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

use super::CompletedPart;
use crate::error::PartError;

/// S3 `CompleteMultipartUpload` body
#[derive(Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteManifest {
    #[serde(rename = "Part")]
    parts: Vec<ManifestPart>,
}

#[derive(Serialize)]
struct ManifestPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// Azure `Put Block List` body
#[derive(Serialize)]
#[serde(rename = "BlockList")]
struct BlockList {
    #[serde(rename = "Latest")]
    latest: Vec<String>,
}

/// Build the S3 completion manifest / 生成合并分片请求体
pub fn complete_multipart_xml(parts: &[CompletedPart]) -> Result<String, PartError> {
    let manifest = CompleteManifest {
        parts: parts
            .iter()
            .map(|p| ManifestPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect(),
    };
    quick_xml::se::to_string(&manifest).map_err(|e| PartError::fatal(format!("manifest encoding failed: {}", e)))
}

/// Build the Azure block list body, block ids in manifest order / 生成块列表请求体
pub fn block_list_xml(parts: &[CompletedPart]) -> Result<String, PartError> {
    let list = BlockList {
        latest: parts.iter().map(|p| p.etag.clone()).collect(),
    };
    let body = quick_xml::se::to_string(&list).map_err(|e| PartError::fatal(format!("block list encoding failed: {}", e)))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>{}", body))
}

/// Azure block id for a part number. Every id of one blob must have the same
/// length before encoding / 块 ID（同一对象内长度必须一致）
pub fn azure_block_id(part_number: u32) -> String {
    BASE64.encode(format!("block-{:08}", part_number))
}

/// Total size from `Content-Range: bytes 0-99/1234` / 解析总大小
pub fn parse_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    if total == "*" {
        return None;
    }
    total.trim().parse().ok()
}

/// `Range` header for a half-open range / 生成 Range 头
pub fn range_header(start: u64, end: u64) -> String {
    format!("bytes={}-{}", start, end.saturating_sub(1))
}

/// Turn a non-success response into a classified error / 校验响应状态
pub async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, PartError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PartError::from_status(status.as_u16(), &body))
}
