use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, OnceLock, RwLock};

use tracing::debug;

use crate::error::Error;
use crate::handler::{HandlerClass, HandlerRole};
use crate::util::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

pub type ClassFactory = Arc<dyn Fn() -> crate::Result<HandlerClass> + Send + Sync>;

/// How a registry key turns into a [`HandlerClass`].
#[derive(Clone)]
pub enum Registration {
    /// Returned as is.
    Class(HandlerClass),
    /// Looked up by name in the registry's [`Namespace`].
    Named(String),
    /// Invoked on first lookup only.
    Factory(ClassFactory),
    /// Asks the registry's [`Loader`] to load `path`, then looks `name` up in the namespace.
    Load { name: String, path: String },
}

impl Registration {
    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> crate::Result<HandlerClass> + Send + Sync + 'static,
    {
        Self::Factory(Arc::new(factory))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn load(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Load {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Class(class) => formatter.debug_tuple("Class").field(class).finish(),
            Self::Named(name) => formatter.debug_tuple("Named").field(name).finish(),
            Self::Factory(_) => formatter.write_str("Factory(..)"),
            Self::Load { name, path } => formatter
                .debug_struct("Load")
                .field("name", name)
                .field("path", path)
                .finish(),
        }
    }
}

impl From<HandlerClass> for Registration {
    fn from(value: HandlerClass) -> Self {
        Self::Class(value)
    }
}

/// Classes a registry can resolve [`Registration::Named`] entries against.
#[derive(Debug, Default)]
pub struct Namespace {
    classes: RwLock<BTreeMap<String, HandlerClass>>,
}

impl Namespace {
    pub fn define(&self, name: impl Into<String>, class: HandlerClass) {
        write_unpoisoned(&self.classes).insert(name.into(), class);
    }

    pub fn get(&self, name: &str) -> Option<HandlerClass> {
        read_unpoisoned(&self.classes).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        read_unpoisoned(&self.classes).contains_key(name)
    }
}

/// Loads optional handler implementations on demand, defining them into a namespace.
pub trait Loader: Send + Sync {
    fn load(&self, path: &str, namespace: &Namespace) -> Result<(), String>;
}

struct RegistryEntry {
    registration: Registration,
    resolved: OnceLock<HandlerClass>,
}

pub struct HandlerRegistry {
    kind: &'static str,
    role: HandlerRole,
    namespace: Namespace,
    entries: RwLock<BTreeMap<String, Arc<RegistryEntry>>>,
    resolve_lock: Mutex<()>,
    loader: RwLock<Option<Arc<dyn Loader>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HandlerRegistry")
            .field("kind", &self.kind)
            .field("keys", &self.keys())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(kind: &'static str, role: HandlerRole) -> Self {
        Self {
            kind,
            role,
            namespace: Namespace::default(),
            entries: RwLock::new(BTreeMap::new()),
            resolve_lock: Mutex::new(()),
            loader: RwLock::new(None),
        }
    }

    pub fn request() -> Arc<Self> {
        Arc::clone(&REQUEST_REGISTRY)
    }

    pub fn response() -> Arc<Self> {
        Arc::clone(&RESPONSE_REGISTRY)
    }

    pub fn adapter() -> Arc<Self> {
        Arc::clone(&ADAPTER_REGISTRY)
    }

    pub fn middleware() -> Arc<Self> {
        Arc::clone(&MIDDLEWARE_REGISTRY)
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn role(&self) -> HandlerRole {
        self.role
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn set_loader(&self, loader: Arc<dyn Loader>) {
        *write_unpoisoned(&self.loader) = Some(loader);
    }

    /// Merges entries into the registry, replacing (and un-caching) existing keys.
    pub fn register<I, K, R>(&self, mapping: I)
    where
        I: IntoIterator<Item = (K, R)>,
        K: Into<String>,
        R: Into<Registration>,
    {
        let mut entries = write_unpoisoned(&self.entries);
        for (key, registration) in mapping {
            entries.insert(
                key.into(),
                Arc::new(RegistryEntry {
                    registration: registration.into(),
                    resolved: OnceLock::new(),
                }),
            );
        }
    }

    pub fn unregister(&self, key: &str) -> bool {
        write_unpoisoned(&self.entries).remove(key).is_some()
    }

    pub fn is_registered(&self, key: &str) -> bool {
        read_unpoisoned(&self.entries).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        read_unpoisoned(&self.entries).keys().cloned().collect()
    }

    pub fn lookup(&self, key: &str) -> crate::Result<HandlerClass> {
        let entry = read_unpoisoned(&self.entries)
            .get(key)
            .cloned()
            .ok_or_else(|| self.not_registered(key))?;
        if let Some(class) = entry.resolved.get() {
            return Ok(class.clone());
        }

        let _guard = lock_unpoisoned(&self.resolve_lock);
        if let Some(class) = entry.resolved.get() {
            return Ok(class.clone());
        }
        let class = self.resolve(key, &entry.registration)?;
        debug!(
            registry = self.kind,
            key,
            class = class.name(),
            available = class.is_available(),
            "resolved handler"
        );
        Ok(entry.resolved.get_or_init(|| class).clone())
    }

    fn resolve(&self, key: &str, registration: &Registration) -> crate::Result<HandlerClass> {
        match registration {
            Registration::Class(class) => Ok(class.clone()),
            Registration::Named(name) => self
                .namespace
                .get(name)
                .ok_or_else(|| self.not_registered(name)),
            Registration::Factory(factory) => factory(),
            Registration::Load { name, path } => {
                let loader = read_unpoisoned(&self.loader).clone();
                let Some(loader) = loader else {
                    return Ok(HandlerClass::unavailable(
                        key,
                        self.role,
                        format!("no loader configured for {path}"),
                    ));
                };
                if let Err(message) = loader.load(path, &self.namespace) {
                    return Ok(HandlerClass::unavailable(key, self.role, message));
                }
                Ok(self.namespace.get(name).unwrap_or_else(|| {
                    HandlerClass::unavailable(
                        key,
                        self.role,
                        format!("{path} loaded but did not define {name}"),
                    )
                }))
            }
        }
    }

    fn not_registered(&self, key: &str) -> Error {
        Error::NotRegistered {
            registry: self.kind,
            key: key.to_owned(),
        }
    }
}

/// The registries a [`PipelineBuilder`](crate::PipelineBuilder) resolves keys against.
#[derive(Clone, Debug)]
pub struct Registries {
    pub request: Arc<HandlerRegistry>,
    pub response: Arc<HandlerRegistry>,
    pub adapter: Arc<HandlerRegistry>,
    pub middleware: Arc<HandlerRegistry>,
    default_adapter: Option<String>,
}

impl Registries {
    pub fn global() -> Self {
        Self {
            request: HandlerRegistry::request(),
            response: HandlerRegistry::response(),
            adapter: HandlerRegistry::adapter(),
            middleware: HandlerRegistry::middleware(),
            default_adapter: None,
        }
    }

    /// Fresh registries holding only the built-in handlers.
    pub fn isolated() -> Self {
        Self {
            request: Arc::new(builtin_request_registry()),
            response: Arc::new(builtin_response_registry()),
            adapter: Arc::new(builtin_adapter_registry()),
            middleware: Arc::new(HandlerRegistry::new("middleware", HandlerRole::Middleware)),
            default_adapter: None,
        }
    }

    pub fn with_default_adapter(mut self, key: impl Into<String>) -> Self {
        self.default_adapter = Some(key.into());
        self
    }

    pub fn default_adapter_key(&self) -> String {
        self.default_adapter.clone().unwrap_or_else(default_adapter)
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::global()
    }
}

#[cfg(feature = "ureq")]
const BUILTIN_DEFAULT_ADAPTER: &str = "ureq";
#[cfg(not(feature = "ureq"))]
const BUILTIN_DEFAULT_ADAPTER: &str = "test";

static DEFAULT_ADAPTER: LazyLock<RwLock<String>> =
    LazyLock::new(|| RwLock::new(BUILTIN_DEFAULT_ADAPTER.to_owned()));

static REQUEST_REGISTRY: LazyLock<Arc<HandlerRegistry>> =
    LazyLock::new(|| Arc::new(builtin_request_registry()));
static RESPONSE_REGISTRY: LazyLock<Arc<HandlerRegistry>> =
    LazyLock::new(|| Arc::new(builtin_response_registry()));
static ADAPTER_REGISTRY: LazyLock<Arc<HandlerRegistry>> =
    LazyLock::new(|| Arc::new(builtin_adapter_registry()));
static MIDDLEWARE_REGISTRY: LazyLock<Arc<HandlerRegistry>> =
    LazyLock::new(|| Arc::new(HandlerRegistry::new("middleware", HandlerRole::Middleware)));

/// Adapter key used when a pipeline is dispatched without one.
pub fn default_adapter() -> String {
    read_unpoisoned(&DEFAULT_ADAPTER).clone()
}

pub fn set_default_adapter(key: impl Into<String>) {
    *write_unpoisoned(&DEFAULT_ADAPTER) = key.into();
}

fn builtin_request_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new("request", HandlerRole::Middleware);
    registry.register([
        ("url_encoded", crate::encoders::url_encoded_class()),
        ("json", crate::encoders::json_request_class()),
        ("authorization", crate::encoders::authorization_class()),
        ("retry", crate::retry::Retry::class()),
    ]);
    registry
}

fn builtin_response_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new("response", HandlerRole::Middleware);
    registry.register([
        ("raise_error", crate::encoders::raise_error_class()),
        ("json", crate::encoders::json_response_class()),
        ("logger", crate::logger::logger_class()),
    ]);
    registry
}

fn builtin_adapter_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new("adapter", HandlerRole::Adapter);
    registry.register([("test", crate::adapter::test::TestAdapter::class())]);
    #[cfg(feature = "ureq")]
    registry.register([(
        "ureq",
        Registration::factory(|| Ok(crate::adapter::ureq::UreqAdapter::class())),
    )]);
    registry
}
