//! Dependency binding registry / 依赖绑定注册表
//!
//! Factories are registered by provider kind, capabilities are bound to
//! selectors, and `resolve` builds an immutable `StorageBindings` in one step:
//! either every bound capability gets a provider or nothing is returned.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::{ObjectStore, PresignIssuer, ProviderBundle, ProviderKind, TransferConfigProvider};
use crate::error::{BindingError, StorageError};

/// Provider factory / 提供方工厂
pub trait ProviderFactory: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Build a provider from its settings object. Bad settings are
    /// `BindingError::InvalidSettings` / 根据配置创建提供方
    fn create(&self, settings: Value) -> Result<ProviderBundle, StorageError>;
}

/// Capability a consumer asks for / 能力类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    ServerStorage,
    ClientStorage,
    PresignedUrlProvider,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::ServerStorage,
        Capability::ClientStorage,
        Capability::PresignedUrlProvider,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ServerStorage => "serverStorage",
            Capability::ClientStorage => "clientStorage",
            Capability::PresignedUrlProvider => "presignedUrlProvider",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serverStorage" | "server_storage" => Ok(Capability::ServerStorage),
            "clientStorage" | "client_storage" => Ok(Capability::ClientStorage),
            "presignedUrlProvider" | "presigned_url_provider" => Ok(Capability::PresignedUrlProvider),
            other => Err(BindingError::UnrecognizedSelector(format!("unknown capability {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStrategy {
    Typed,
    Environment,
}

/// How a capability picks its provider / 提供方选择方式
///
/// ```json
/// { "dependencyName": "s3" }
/// { "bindingStrategy": "typed", "instance": { "provider": "azure", "account_name": "..." } }
/// { "bindingStrategy": "environment", "instance": { "prefix": "OBJSTORE" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderSelector {
    Direct {
        #[serde(rename = "dependencyName")]
        dependency_name: String,
    },
    Strategy {
        #[serde(rename = "bindingStrategy")]
        binding_strategy: BindingStrategy,
        instance: Value,
    },
}

impl ProviderSelector {
    pub fn named(name: impl Into<String>) -> Self {
        ProviderSelector::Direct {
            dependency_name: name.into(),
        }
    }

    pub fn typed(instance: Value) -> Self {
        ProviderSelector::Strategy {
            binding_strategy: BindingStrategy::Typed,
            instance,
        }
    }

    pub fn environment(prefix: impl Into<String>) -> Self {
        ProviderSelector::Strategy {
            binding_strategy: BindingStrategy::Environment,
            instance: serde_json::json!({ "prefix": prefix.into() }),
        }
    }

    /// Parse a selector from configuration, rejecting unknown shapes / 解析选择器
    pub fn from_value(value: Value) -> Result<Self, BindingError> {
        let shown = value.to_string();
        let selector: ProviderSelector =
            serde_json::from_value(value).map_err(|_| BindingError::UnrecognizedSelector(shown))?;
        selector.check_shape()?;
        Ok(selector)
    }

    /// Structural check done at parse time, before any provider is built
    pub fn check_shape(&self) -> Result<(), BindingError> {
        match self {
            ProviderSelector::Direct { dependency_name } if dependency_name.trim().is_empty() => Err(
                BindingError::UnrecognizedSelector("dependencyName must not be empty".to_string()),
            ),
            ProviderSelector::Direct { .. } => Ok(()),
            ProviderSelector::Strategy {
                binding_strategy: BindingStrategy::Typed,
                instance,
            } => match instance.get("provider").and_then(Value::as_str) {
                Some(_) => Ok(()),
                None => Err(BindingError::UnrecognizedSelector(format!(
                    "typed binding needs instance.provider: {}",
                    instance
                ))),
            },
            ProviderSelector::Strategy {
                binding_strategy: BindingStrategy::Environment,
                instance,
            } => match instance.get("prefix").and_then(Value::as_str) {
                Some(p) if !p.is_empty() => Ok(()),
                _ => Err(BindingError::UnrecognizedSelector(format!(
                    "environment binding needs instance.prefix: {}",
                    instance
                ))),
            },
        }
    }

    /// Stable identity used to share one provider between capabilities
    fn identity(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

impl fmt::Display for ProviderSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSelector::Direct { dependency_name } => write!(f, "dependencyName={}", dependency_name),
            ProviderSelector::Strategy {
                binding_strategy: BindingStrategy::Typed,
                instance,
            } => write!(
                f,
                "typed({})",
                instance.get("provider").and_then(Value::as_str).unwrap_or("?")
            ),
            ProviderSelector::Strategy {
                binding_strategy: BindingStrategy::Environment,
                instance,
            } => write!(
                f,
                "environment({})",
                instance.get("prefix").and_then(Value::as_str).unwrap_or("?")
            ),
        }
    }
}

/// Source of environment variables / 环境变量来源
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment / 进程环境变量
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// `<PREFIX>_<SUFFIX>` -> settings key
const ENV_SETTINGS: &[(&str, &str)] = &[
    ("ACCESS_KEY_ID", "access_key_id"),
    ("SECRET_ACCESS_KEY", "secret_access_key"),
    ("SESSION_TOKEN", "session_token"),
    ("REGION", "region"),
    ("ENDPOINT", "endpoint"),
    ("ACCOUNT_NAME", "account_name"),
    ("ACCOUNT_KEY", "account_key"),
];

/// Resolved providers per capability; immutable once built / 已解析的绑定
#[derive(Clone, Debug)]
pub struct StorageBindings {
    bundles: BTreeMap<Capability, ProviderBundle>,
}

impl StorageBindings {
    pub fn resolve(&self, capability: Capability) -> Result<&ProviderBundle, BindingError> {
        self.bundles
            .get(&capability)
            .ok_or_else(|| BindingError::MissingCapability(capability.to_string()))
    }

    pub fn server_storage(&self) -> Result<Arc<dyn ObjectStore>, BindingError> {
        Ok(self.resolve(Capability::ServerStorage)?.store.clone())
    }

    pub fn client_storage(&self) -> Result<Arc<dyn TransferConfigProvider>, BindingError> {
        Ok(self.resolve(Capability::ClientStorage)?.transfer.clone())
    }

    pub fn presigned_url_provider(&self) -> Result<Arc<dyn PresignIssuer>, BindingError> {
        Ok(self.resolve(Capability::PresignedUrlProvider)?.issuer.clone())
    }

    pub fn kind(&self, capability: Capability) -> Option<ProviderKind> {
        self.bundles.get(&capability).map(|b| b.kind)
    }
}

/// Provider registry / 提供方注册表
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, Arc<dyn ProviderFactory>>,
    bindings: BTreeMap<Capability, ProviderSelector>,
    provider_settings: HashMap<String, Value>,
    env: Arc<dyn EnvSource>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            bindings: BTreeMap::new(),
            provider_settings: HashMap::new(),
            env: Arc::new(ProcessEnv),
        }
    }

    pub fn with_env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    /// Named settings used by `dependencyName` selectors (`providers` section)
    pub fn with_provider_settings(mut self, settings: HashMap<String, Value>) -> Self {
        self.provider_settings = settings;
        self
    }

    /// Register provider factory / 注册提供方工厂
    pub fn register_factory(&mut self, factory: Arc<dyn ProviderFactory>) {
        let kind = factory.kind();
        self.factories.insert(kind, factory);
        tracing::info!("Provider factory registered: {}", kind);
    }

    pub fn has_factory(&self, kind: ProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Bind a capability / 绑定能力
    pub fn bind(&mut self, capability: Capability, selector: ProviderSelector) -> Result<(), BindingError> {
        selector.check_shape()?;
        if let Some(existing) = self.bindings.get(&capability) {
            if *existing == selector {
                return Ok(());
            }
            return Err(BindingError::BindingConflict {
                capability: capability.to_string(),
                existing: existing.to_string(),
                requested: selector.to_string(),
            });
        }
        tracing::debug!("Bound {} -> {}", capability, selector);
        self.bindings.insert(capability, selector);
        Ok(())
    }

    /// Bind every capability to the same selector
    pub fn bind_all(&mut self, selector: ProviderSelector) -> Result<(), BindingError> {
        for capability in Capability::ALL {
            self.bind(capability, selector.clone())?;
        }
        Ok(())
    }

    /// Build all bound capabilities / 解析全部绑定
    pub fn resolve(&self) -> Result<StorageBindings, StorageError> {
        let mut built: HashMap<String, ProviderBundle> = HashMap::new();
        let mut bundles = BTreeMap::new();

        for (capability, selector) in &self.bindings {
            let identity = selector.identity();
            let bundle = match built.get(&identity) {
                Some(bundle) => bundle.clone(),
                None => {
                    let (kind, settings) = self.materialize(selector)?;
                    let factory = self
                        .factories
                        .get(&kind)
                        .ok_or_else(|| BindingError::UnknownProvider(kind.to_string()))?;
                    let bundle = factory.create(settings)?;
                    tracing::info!("Provider created: {} for {}", kind, selector);
                    built.insert(identity, bundle.clone());
                    bundle
                }
            };
            bundles.insert(*capability, bundle);
        }

        Ok(StorageBindings { bundles })
    }

    /// Provider kind and settings object for a selector
    fn materialize(&self, selector: &ProviderSelector) -> Result<(ProviderKind, Value), BindingError> {
        match selector {
            ProviderSelector::Direct { dependency_name } => {
                let settings = self
                    .provider_settings
                    .get(dependency_name)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                let kind = match settings.get("provider").and_then(Value::as_str) {
                    Some(provider) => provider.parse()?,
                    None => dependency_name.parse()?,
                };
                Ok((kind, settings))
            }
            ProviderSelector::Strategy {
                binding_strategy: BindingStrategy::Typed,
                instance,
            } => {
                let provider = instance
                    .get("provider")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BindingError::UnrecognizedSelector(instance.to_string()))?;
                Ok((provider.parse()?, instance.clone()))
            }
            ProviderSelector::Strategy {
                binding_strategy: BindingStrategy::Environment,
                instance,
            } => {
                let prefix = instance
                    .get("prefix")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BindingError::UnrecognizedSelector(instance.to_string()))?;
                self.settings_from_env(prefix)
            }
        }
    }

    fn settings_from_env(&self, prefix: &str) -> Result<(ProviderKind, Value), BindingError> {
        let var = |suffix: &str| self.env.var(&format!("{}_{}", prefix, suffix));

        let provider = var("PROVIDER").ok_or_else(|| BindingError::InvalidSettings {
            provider: format!("environment({})", prefix),
            reason: format!("{}_PROVIDER is not set", prefix),
        })?;
        let kind: ProviderKind = provider.parse()?;

        let mut settings = Map::new();
        settings.insert("provider".to_string(), Value::String(kind.to_string()));
        for (suffix, key) in ENV_SETTINGS {
            if let Some(value) = var(suffix) {
                settings.insert(key.to_string(), Value::String(value));
            }
        }
        if let Some(value) = var("PATH_STYLE") {
            let flag = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
            settings.insert("force_path_style".to_string(), Value::Bool(flag));
        }
        tracing::debug!("Provider settings read from environment prefix {}", prefix);
        Ok((kind, Value::Object(settings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryProvider, MemoryProviderFactory};
    use crate::reference::ObjectReference;
    use crate::storage::Operation;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Memory-backed factory that records the settings it was given
    struct RecordingFactory {
        kind: ProviderKind,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    impl ProviderFactory for RecordingFactory {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn create(&self, settings: Value) -> Result<ProviderBundle, StorageError> {
            self.seen.lock().push(settings);
            Ok(ProviderBundle::from_driver(self.kind, Arc::new(MemoryProvider::default())))
        }
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register_factory(Arc::new(MemoryProviderFactory));
        registry
    }

    #[test]
    fn test_conflicting_bind() {
        let mut registry = registry();
        registry
            .bind(Capability::ServerStorage, ProviderSelector::named("memory"))
            .unwrap();
        // same selector again is a no-op
        registry
            .bind(Capability::ServerStorage, ProviderSelector::named("memory"))
            .unwrap();
        let err = registry
            .bind(Capability::ServerStorage, ProviderSelector::named("s3"))
            .unwrap_err();
        assert!(matches!(err, BindingError::BindingConflict { .. }));
    }

    #[test]
    fn test_resolve_shares_bundle() {
        let mut registry = registry();
        registry.bind_all(ProviderSelector::named("memory")).unwrap();
        let bindings = registry.resolve().unwrap();

        let server = bindings.resolve(Capability::ServerStorage).unwrap();
        let client = bindings.resolve(Capability::ClientStorage).unwrap();
        assert!(Arc::ptr_eq(&server.store, &client.store));
        assert_eq!(bindings.kind(Capability::PresignedUrlProvider), Some(ProviderKind::Memory));
    }

    #[test]
    fn test_unknown_provider() {
        let mut registry = registry();
        registry
            .bind(Capability::ServerStorage, ProviderSelector::named("ftp"))
            .unwrap();
        let err = registry.resolve().unwrap_err();
        assert!(matches!(err, StorageError::Binding(BindingError::UnknownProvider(p)) if p == "ftp"));
    }

    #[test]
    fn test_known_kind_without_factory() {
        let mut registry = registry();
        registry.bind(Capability::ServerStorage, ProviderSelector::named("s3")).unwrap();
        assert!(matches!(
            registry.resolve(),
            Err(StorageError::Binding(BindingError::UnknownProvider(_)))
        ));
    }

    #[test]
    fn test_resolution_is_atomic() {
        let mut registry = registry();
        registry
            .bind(Capability::ServerStorage, ProviderSelector::named("memory"))
            .unwrap();
        registry
            .bind(Capability::ClientStorage, ProviderSelector::named("azure"))
            .unwrap();
        // azure factory missing: nothing is returned
        assert!(registry.resolve().is_err());
    }

    #[test]
    fn test_missing_capability() {
        let mut registry = registry();
        registry
            .bind(Capability::ServerStorage, ProviderSelector::named("memory"))
            .unwrap();
        let bindings = registry.resolve().unwrap();
        assert!(bindings.server_storage().is_ok());
        assert_eq!(
            bindings.client_storage().err(),
            Some(BindingError::MissingCapability("clientStorage".to_string()))
        );
    }

    #[test]
    fn test_typed_strategy() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ProviderRegistry::new();
        registry.register_factory(Arc::new(RecordingFactory {
            kind: ProviderKind::Azure,
            seen: seen.clone(),
        }));
        let instance = json!({ "provider": "azure", "account_name": "dev" });
        registry
            .bind(Capability::ClientStorage, ProviderSelector::typed(instance.clone()))
            .unwrap();
        let bindings = registry.resolve().unwrap();
        assert_eq!(bindings.kind(Capability::ClientStorage), Some(ProviderKind::Azure));
        assert_eq!(seen.lock()[0], instance);
    }

    #[test]
    fn test_environment_strategy() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let env: HashMap<String, String> = [
            ("OBJSTORE_PROVIDER", "minio"),
            ("OBJSTORE_ACCESS_KEY_ID", "minioadmin"),
            ("OBJSTORE_SECRET_ACCESS_KEY", "secret"),
            ("OBJSTORE_ENDPOINT", "http://localhost:9000"),
            ("OBJSTORE_PATH_STYLE", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut registry = ProviderRegistry::new().with_env(Arc::new(env));
        registry.register_factory(Arc::new(RecordingFactory {
            kind: ProviderKind::Minio,
            seen: seen.clone(),
        }));
        registry.bind_all(ProviderSelector::environment("OBJSTORE")).unwrap();
        registry.resolve().unwrap();

        let seen = seen.lock();
        // one provider for all three capabilities
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["access_key_id"], "minioadmin");
        assert_eq!(seen[0]["endpoint"], "http://localhost:9000");
        assert_eq!(seen[0]["force_path_style"], true);
        assert!(seen[0].get("session_token").is_none());
    }

    #[test]
    fn test_environment_without_provider() {
        let mut registry = registry().with_env(Arc::new(HashMap::<String, String>::new()));
        registry
            .bind(Capability::ServerStorage, ProviderSelector::environment("EMPTY"))
            .unwrap();
        assert!(matches!(
            registry.resolve(),
            Err(StorageError::Binding(BindingError::InvalidSettings { .. }))
        ));
    }

    #[test]
    fn test_named_settings_section() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut providers = HashMap::new();
        providers.insert("archive".to_string(), json!({ "provider": "google", "region": "auto" }));
        let mut registry = ProviderRegistry::new().with_provider_settings(providers);
        registry.register_factory(Arc::new(RecordingFactory {
            kind: ProviderKind::Google,
            seen: seen.clone(),
        }));
        registry
            .bind(Capability::ServerStorage, ProviderSelector::named("archive"))
            .unwrap();
        let bindings = registry.resolve().unwrap();
        assert_eq!(bindings.kind(Capability::ServerStorage), Some(ProviderKind::Google));
        assert_eq!(seen.lock()[0]["region"], "auto");
    }

    #[test]
    fn test_unrecognized_selector() {
        assert!(matches!(
            ProviderSelector::from_value(json!({ "provider": "s3" })),
            Err(BindingError::UnrecognizedSelector(_))
        ));
        assert!(matches!(
            ProviderSelector::from_value(json!({ "bindingStrategy": "magic", "instance": {} })),
            Err(BindingError::UnrecognizedSelector(_))
        ));
        assert!(matches!(
            ProviderSelector::from_value(json!({ "bindingStrategy": "typed", "instance": {} })),
            Err(BindingError::UnrecognizedSelector(_))
        ));
        assert_eq!(
            ProviderSelector::from_value(json!({ "dependencyName": "s3" })).unwrap(),
            ProviderSelector::named("s3")
        );
    }

    #[test]
    fn test_same_config_resolves_alike() {
        let instance = json!({
            "provider": "s3",
            "region": "eu-west-1",
            "access_key_id": "AKID",
            "secret_access_key": "secret",
        });
        let build = || {
            let mut registry = ProviderRegistry::new();
            registry.register_factory(Arc::new(crate::drivers::s3::S3ProviderFactory::aws()));
            registry.bind_all(ProviderSelector::typed(instance.clone())).unwrap();
            registry.resolve().unwrap()
        };
        let (a, b) = (build(), build());
        for capability in Capability::ALL {
            assert_eq!(a.kind(capability), b.kind(capability));
        }

        let reference = ObjectReference::new("bucket", "reports/2024", "q1.csv");
        for operation in [Operation::Read, Operation::Write] {
            let issue = |bindings: &StorageBindings| {
                bindings
                    .presigned_url_provider()
                    .unwrap()
                    .issue(&reference, operation, std::time::Duration::from_secs(600))
                    .unwrap()
            };
            let (x, y) = (issue(&a), issue(&b));
            assert_eq!(x.operation, y.operation);
            assert_eq!(x.locator, y.locator);
            assert_eq!(x.permission, y.permission);
            assert_eq!(x.ttl(), y.ttl());
            assert_eq!(x.ttl(), chrono::Duration::seconds(600));
        }
        assert_eq!(
            a.server_storage().unwrap().info(),
            b.server_storage().unwrap().info()
        );
    }
}
