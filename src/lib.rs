pub mod config;
pub mod error;
pub mod reference;
pub mod sign;
pub mod storage;
pub mod transfer;

// Driver modules (point to project root drivers via path attribute) / 驱动模块
#[path = "../drivers/mod.rs"]
pub mod drivers;

pub use error::{BindingError, StorageError, ValidationError};
pub use reference::{ObjectPrefix, ObjectReference};

/// Registry with every built-in provider and the bindings from `config`
/// 根据配置创建注册表并注册所有驱动
pub fn build_registry(config: &config::AppConfig) -> Result<storage::ProviderRegistry, BindingError> {
    let mut registry = config.registry();
    drivers::register_all(&mut registry);
    config.bind(&mut registry)?;
    Ok(registry)
}
