//! Azure驱动配置

use serde::{Deserialize, Serialize};

use crate::storage::MIB;

/// Azure配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    /// 存储账户名
    #[serde(default)]
    pub account_name: String,
    /// 账户密钥（base64）
    #[serde(default)]
    pub account_key: String,
    /// Blob服务端点，不填使用 https://{account}.blob.core.windows.net
    /// Azurite: http://127.0.0.1:10000/devstoreaccount1
    #[serde(default)]
    pub endpoint: String,
    /// 预签名URL过期时间（小时）
    #[serde(default = "default_sign_expire")]
    pub sign_url_expire: u32,
    /// 分块大小（MB）
    #[serde(default = "default_chunk_size_mib")]
    pub chunk_size_mib: u64,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_sign_expire() -> u32 {
    4
}

fn default_chunk_size_mib() -> u64 {
    4
}

fn default_concurrency() -> usize {
    8
}

fn default_pool_size() -> usize {
    16
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            account_name: String::new(),
            account_key: String::new(),
            endpoint: String::new(),
            sign_url_expire: default_sign_expire(),
            chunk_size_mib: default_chunk_size_mib(),
            max_concurrency: default_concurrency(),
            pool_size: default_pool_size(),
        }
    }
}

impl AzureConfig {
    /// Service endpoint without trailing slash / 服务端点
    pub fn blob_endpoint(&self) -> String {
        if self.endpoint.trim().is_empty() {
            format!("https://{}.blob.core.windows.net", self.account_name)
        } else {
            self.endpoint.trim().trim_end_matches('/').to_string()
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mib.max(1) * MIB
    }
}
