//! Application configuration module / 应用配置模块
//!
//! Loaded from config.json (path overridable with `OBJSTORE_CONFIG`).
//! Creates default config file on first run / 首次运行时创建默认配置文件

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::BindingError;
use crate::storage::{Capability, ProviderRegistry, ProviderSelector};

/// Environment variable naming the config file / 配置文件路径环境变量
pub const CONFIG_ENV: &str = "OBJSTORE_CONFIG";

/// Application configuration / 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Selector used by every capability without an override / 默认提供方
    #[serde(default = "default_storage")]
    pub storage: ProviderSelector,
    /// Per-capability selectors (`serverStorage`, `clientStorage`, `presignedUrlProvider`)
    /// 按能力覆盖的提供方
    #[serde(default)]
    pub overrides: HashMap<String, ProviderSelector>,
    /// Named provider settings for `dependencyName` selectors / 提供方配置
    #[serde(default)]
    pub providers: HashMap<String, Value>,
    /// Tracing filter when `RUST_LOG` is unset / 日志过滤
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Grant validity used by the CLI when none is given (seconds) / 默认签名有效期
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_storage() -> ProviderSelector {
    ProviderSelector::named("memory")
}

fn default_log_filter() -> String {
    "yaolist_objstore=info".to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            overrides: HashMap::new(),
            providers: HashMap::new(),
            log_filter: default_log_filter(),
            default_ttl_secs: default_ttl_secs(),
        }
    }
}

impl AppConfig {
    /// Selector for a capability / 获取能力对应的选择器
    pub fn selector(&self, capability: Capability) -> &ProviderSelector {
        self.overrides
            .get(capability.as_str())
            .unwrap_or(&self.storage)
    }

    /// Reject unknown capability names and malformed selectors / 校验配置
    pub fn validate(&self) -> Result<(), BindingError> {
        self.storage.check_shape()?;
        for (name, selector) in &self.overrides {
            name.parse::<Capability>()?;
            selector.check_shape()?;
        }
        Ok(())
    }

    /// Registry seeded with the `providers` section / 创建注册表
    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::new().with_provider_settings(self.providers.clone())
    }

    /// Bind every capability / 绑定全部能力
    pub fn bind(&self, registry: &mut ProviderRegistry) -> Result<(), BindingError> {
        self.validate()?;
        for capability in Capability::ALL {
            registry.bind(capability, self.selector(capability).clone())?;
        }
        Ok(())
    }
}

/// Get the config file path / 获取配置文件路径
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.json")
}

/// Load configuration from file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config() -> Result<AppConfig, String> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(config_path: &Path) -> Result<AppConfig, String> {
    if config_path.exists() {
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;
        config
            .validate()
            .map_err(|e| format!("Invalid storage binding in config file: {}", e))?;

        tracing::info!("Loaded configuration from {:?}", config_path);
        Ok(config)
    } else {
        let config = AppConfig::default();
        save_config_to(config_path, &config)?;
        tracing::info!("Created default configuration at {:?}", config_path);
        Ok(config)
    }
}

/// Save configuration to file / 保存配置到文件
pub fn save_config_to(config_path: &Path, config: &AppConfig) -> Result<(), String> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    std::fs::write(config_path, content)
        .map_err(|e| format!("Failed to write config file: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryProviderFactory, ProviderKind};
    use std::sync::Arc;

    #[test]
    fn test_default_created_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = load_config_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.storage, ProviderSelector::named("memory"));

        let again = load_config_from(&path).unwrap();
        assert_eq!(again.log_filter, "yaolist_objstore=info");
    }

    #[test]
    fn test_overrides_and_providers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "storage": { "dependencyName": "local" },
                "overrides": {
                    "presignedUrlProvider": { "bindingStrategy": "environment", "instance": { "prefix": "OBJSTORE" } }
                },
                "providers": { "local": { "provider": "memory", "chunk_size": 1024 } }
            }"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.selector(Capability::ServerStorage), &ProviderSelector::named("local"));
        assert_eq!(
            config.selector(Capability::PresignedUrlProvider),
            &ProviderSelector::environment("OBJSTORE")
        );

        let mut registry = config.registry();
        registry.register_factory(Arc::new(MemoryProviderFactory));
        config.bind(&mut registry).unwrap();
        // environment binding is only read at resolution; keep it out of this check
        let mut server_only = config.registry();
        server_only.register_factory(Arc::new(MemoryProviderFactory));
        server_only
            .bind(Capability::ServerStorage, config.selector(Capability::ServerStorage).clone())
            .unwrap();
        let bindings = server_only.resolve().unwrap();
        assert_eq!(bindings.kind(Capability::ServerStorage), Some(ProviderKind::Memory));
        assert_eq!(bindings.server_storage().unwrap().info().chunk_size, 1024);
    }

    #[test]
    fn test_unrecognized_selector_fails_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "storage": { "provider": "s3" } }"#).unwrap();
        assert!(load_config_from(&path).is_err());

        std::fs::write(
            &path,
            r#"{ "storage": { "dependencyName": "s3" }, "overrides": { "backupStorage": { "dependencyName": "s3" } } }"#,
        )
        .unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(err.contains("backupStorage"));
    }
}
