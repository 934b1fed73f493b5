//! Local request signing / 本地签名
//!
//! Nothing here performs I/O: a grant is a pure function of credentials,
//! the object location, the operation and the clock.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

pub mod sas;
pub mod sigv4;

pub use sas::{BlobSasBuilder, SasResource};
pub use sigv4::{SigV4Credentials, SigV4Dialect, SigV4Presigner};

type HmacSha256 = Hmac<Sha256>;

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| StorageError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// URI-encode every segment of an object path, keeping the separators
/// 逐段编码对象路径
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("/bucket/a b/c+d.txt"), "/bucket/a%20b/c%2Bd.txt");
        assert_eq!(encode_path("/bucket/数据.bin"), "/bucket/%E6%95%B0%E6%8D%AE.bin");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
