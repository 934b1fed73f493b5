//! Object addressing / 对象寻址
//!
//! An object is addressed by container (base directory), a `/`-separated
//! relative directory and a leaf name. References are plain data: they are
//! validated at the start of every operation, never at construction, so a
//! malformed wire value is always rejected before any provider call.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Canonical path separator / 规范分隔符
pub const SEPARATOR: char = '/';

/// Object reference / 对象引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Container / bucket name / 容器或存储桶
    pub base_directory: String,
    /// Zero or more `/` separated segments / 相对目录
    #[serde(default)]
    pub relative_directory: String,
    /// Leaf name / 对象名
    pub object_name: String,
}

impl ObjectReference {
    pub fn new(
        base_directory: impl Into<String>,
        relative_directory: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            base_directory: base_directory.into(),
            relative_directory: relative_directory.into(),
            object_name: object_name.into(),
        }
    }

    /// Validate all three parts / 校验引用
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_base_directory(&self.base_directory)?;
        normalize_relative_directory(&self.relative_directory)?;
        if self.object_name.is_empty()
            || self.object_name.contains(SEPARATOR)
            || self.object_name.contains('\\')
            || self.object_name == "."
            || self.object_name == ".."
        {
            return Err(ValidationError::InvalidObjectName(self.object_name.clone()));
        }
        Ok(())
    }

    /// Object key inside the container, e.g. `a/b/file.bin` / 获取对象键
    pub fn key(&self) -> Result<String, ValidationError> {
        self.validate()?;
        let dir = normalize_relative_directory(&self.relative_directory)?;
        if dir.is_empty() {
            Ok(self.object_name.clone())
        } else {
            Ok(format!("{}/{}", dir, self.object_name))
        }
    }

    /// Rebuild a reference from a container and a provider key / 从对象键还原引用
    pub fn from_key(base_directory: &str, key: &str) -> Option<Self> {
        let key = key.trim_start_matches(SEPARATOR);
        if key.is_empty() || key.ends_with(SEPARATOR) {
            return None;
        }
        let (dir, name) = match key.rfind(SEPARATOR) {
            Some(pos) => (&key[..pos], &key[pos + 1..]),
            None => ("", key),
        };
        Some(Self::new(base_directory, dir, name))
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = self.relative_directory.trim_matches(SEPARATOR);
        if dir.is_empty() {
            write!(f, "{}/{}", self.base_directory, self.object_name)
        } else {
            write!(f, "{}/{}/{}", self.base_directory, dir, self.object_name)
        }
    }
}

/// Listing input: container + directory / 列表前缀
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPrefix {
    pub base_directory: String,
    #[serde(default)]
    pub relative_directory: String,
}

impl ObjectPrefix {
    pub fn new(base_directory: impl Into<String>, relative_directory: impl Into<String>) -> Self {
        Self {
            base_directory: base_directory.into(),
            relative_directory: relative_directory.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_base_directory(&self.base_directory)?;
        normalize_relative_directory(&self.relative_directory)?;
        Ok(())
    }

    /// Key prefix ending with `/`, or empty for the container root / 键前缀
    pub fn key_prefix(&self) -> Result<String, ValidationError> {
        validate_base_directory(&self.base_directory)?;
        let dir = normalize_relative_directory(&self.relative_directory)?;
        if dir.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!("{}/", dir))
        }
    }
}

fn validate_base_directory(base: &str) -> Result<(), ValidationError> {
    if base.is_empty() || base.contains(SEPARATOR) || base.contains('\\') {
        return Err(ValidationError::InvalidBaseDirectory(base.to_string()));
    }
    Ok(())
}

/// Normalize a relative directory to `seg/seg` form / 规范化相对目录
///
/// Leading, trailing and repeated separators are dropped. Backslashes and
/// `.`/`..` segments are rejected.
pub fn normalize_relative_directory(dir: &str) -> Result<String, ValidationError> {
    if dir.contains('\\') {
        return Err(ValidationError::InvalidRelativeDirectory {
            value: dir.to_string(),
            reason: "backslashes are not allowed, use '/' as the separator".to_string(),
        });
    }

    let mut segments = Vec::new();
    for segment in dir.split(SEPARATOR) {
        match segment {
            "" => continue,
            "." | ".." => {
                return Err(ValidationError::InvalidRelativeDirectory {
                    value: dir.to_string(),
                    reason: format!("segment {:?} is not allowed", segment),
                })
            }
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key() {
        let r = ObjectReference::new("container", "a/b", "file.bin");
        assert_eq!(r.key().unwrap(), "a/b/file.bin");

        let r = ObjectReference::new("container", "", "file.bin");
        assert_eq!(r.key().unwrap(), "file.bin");

        let r = ObjectReference::new("container", "/a//b/", "file.bin");
        assert_eq!(r.key().unwrap(), "a/b/file.bin");
    }

    #[test]
    fn test_backslash_rejected() {
        let r = ObjectReference::new("container", "a\\b", "file.bin");
        let err = r.validate().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRelativeDirectory { .. }));
        assert!(err.to_string().contains("backslashes are not allowed"));
    }

    #[test]
    fn test_invalid_parts() {
        assert!(matches!(
            ObjectReference::new("", "a", "f").validate(),
            Err(ValidationError::InvalidBaseDirectory(_))
        ));
        assert!(matches!(
            ObjectReference::new("c/d", "a", "f").validate(),
            Err(ValidationError::InvalidBaseDirectory(_))
        ));
        assert!(matches!(
            ObjectReference::new("c", "a", "").validate(),
            Err(ValidationError::InvalidObjectName(_))
        ));
        assert!(matches!(
            ObjectReference::new("c", "a", "x/y").validate(),
            Err(ValidationError::InvalidObjectName(_))
        ));
        assert!(matches!(
            ObjectReference::new("c", "a/../b", "f").validate(),
            Err(ValidationError::InvalidRelativeDirectory { .. })
        ));
    }

    #[test]
    fn test_from_key() {
        let r = ObjectReference::from_key("c", "a/b/file.bin").unwrap();
        assert_eq!(r, ObjectReference::new("c", "a/b", "file.bin"));

        let r = ObjectReference::from_key("c", "file.bin").unwrap();
        assert_eq!(r, ObjectReference::new("c", "", "file.bin"));

        assert!(ObjectReference::from_key("c", "a/b/").is_none());
    }

    #[test]
    fn test_prefix() {
        assert_eq!(ObjectPrefix::new("c", "").key_prefix().unwrap(), "");
        assert_eq!(ObjectPrefix::new("c", "a/b/").key_prefix().unwrap(), "a/b/");
        assert!(ObjectPrefix::new("c", "a\\b").key_prefix().is_err());
    }

    #[test]
    fn test_wire_form() {
        let r: ObjectReference = serde_json::from_str(
            r#"{"baseDirectory":"container","relativeDirectory":"a/b","objectName":"file.bin"}"#,
        )
        .unwrap();
        assert_eq!(r, ObjectReference::new("container", "a/b", "file.bin"));
        assert_eq!(r.to_string(), "container/a/b/file.bin");
    }
}
