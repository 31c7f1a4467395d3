use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::error::Error;
use crate::handler::{App, HandlerArgs, HandlerClass};
use crate::registry::{HandlerRegistry, Registries};

#[derive(Clone)]
enum DescriptorTarget {
    Class(HandlerClass),
    Registered {
        registry: Arc<HandlerRegistry>,
        key: String,
    },
}

/// One entry of a handler stack: a name, a lazily resolved class and its arguments.
///
/// Descriptors compare by name only.
#[derive(Clone)]
pub struct HandlerDescriptor {
    name: String,
    target: DescriptorTarget,
    resolved: OnceLock<HandlerClass>,
    args: HandlerArgs,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("resolved", &self.resolved.get().is_some())
            .field("args", &self.args)
            .finish()
    }
}

impl PartialEq for HandlerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for HandlerDescriptor {}

impl HandlerDescriptor {
    pub fn from_class(class: HandlerClass, args: HandlerArgs) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(class.clone());
        Self {
            name: class.name().to_owned(),
            target: DescriptorTarget::Class(class),
            resolved,
            args,
        }
    }

    pub fn from_key(
        registry: Arc<HandlerRegistry>,
        key: impl Into<String>,
        args: HandlerArgs,
    ) -> crate::Result<Self> {
        let key = key.into();
        if !registry.is_registered(&key) {
            return Err(Error::NotRegistered {
                registry: registry.kind(),
                key,
            });
        }
        Ok(Self {
            name: key.clone(),
            target: DescriptorTarget::Registered { registry, key },
            resolved: OnceLock::new(),
            args,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &HandlerArgs {
        &self.args
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Resolves the target class once and caches it.
    pub fn class(&self) -> crate::Result<HandlerClass> {
        if let Some(class) = self.resolved.get() {
            return Ok(class.clone());
        }
        let class = match &self.target {
            DescriptorTarget::Class(class) => class.clone(),
            DescriptorTarget::Registered { registry, key } => registry.lookup(key)?,
        };
        Ok(self.resolved.get_or_init(|| class).clone())
    }

    pub fn build(&self, inner: Option<App>) -> crate::Result<App> {
        self.class()?.build(inner, &self.args)
    }
}

/// Where to apply a positional stack mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerIndex {
    Position(usize),
    Named(String),
}

impl From<usize> for HandlerIndex {
    fn from(value: usize) -> Self {
        Self::Position(value)
    }
}

impl From<&str> for HandlerIndex {
    fn from(value: &str) -> Self {
        Self::Named(value.to_owned())
    }
}

impl From<String> for HandlerIndex {
    fn from(value: String) -> Self {
        Self::Named(value)
    }
}

impl From<&HandlerClass> for HandlerIndex {
    fn from(value: &HandlerClass) -> Self {
        Self::Named(value.name().to_owned())
    }
}

impl std::fmt::Display for HandlerIndex {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Position(position) => write!(formatter, "#{position}"),
            Self::Named(name) => formatter.write_str(name),
        }
    }
}

/// Ordered middleware stack plus a single terminal adapter.
///
/// The stack can be mutated until it is locked, which happens on the first call to
/// [`PipelineBuilder::app`]. After that every mutation fails with [`Error::StackLocked`].
#[derive(Clone)]
pub struct PipelineBuilder {
    handlers: Vec<HandlerDescriptor>,
    adapter: Option<HandlerDescriptor>,
    locked: bool,
    registries: Registries,
    app: Option<App>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for PipelineBuilder {
    fn eq(&self, other: &Self) -> bool {
        self.handlers == other.handlers && self.adapter == other.adapter
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PipelineBuilder")
            .field("handlers", &self.handler_names())
            .field(
                "adapter",
                &self.adapter.as_ref().map(HandlerDescriptor::name),
            )
            .field("locked", &self.locked)
            .finish()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::with_registries(Registries::global())
    }

    pub fn with_registries(registries: Registries) -> Self {
        Self {
            handlers: Vec::new(),
            adapter: None,
            locked: false,
            registries,
            app: None,
        }
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn handlers(&self) -> &[HandlerDescriptor] {
        &self.handlers
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(HandlerDescriptor::name).collect()
    }

    pub fn adapter_descriptor(&self) -> Option<&HandlerDescriptor> {
        self.adapter.as_ref()
    }

    pub fn lock(&mut self) {
        if !self.locked {
            debug!(handlers = self.handlers.len(), "locking handler stack");
        }
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Appends a middleware class.
    pub fn use_handler(
        &mut self,
        class: HandlerClass,
        args: HandlerArgs,
    ) -> crate::Result<&mut Self> {
        self.ensure_unlocked()?;
        ensure_not_adapter(&class)?;
        self.handlers.push(HandlerDescriptor::from_class(class, args));
        Ok(self)
    }

    /// Appends a middleware registered in the generic middleware registry.
    pub fn use_key(&mut self, key: &str, args: HandlerArgs) -> crate::Result<&mut Self> {
        let registry = Arc::clone(&self.registries.middleware);
        self.push_registered(registry, key, args)
    }

    /// Appends a request middleware by key, e.g. `url_encoded` or `retry`.
    pub fn request(&mut self, key: &str, args: HandlerArgs) -> crate::Result<&mut Self> {
        let registry = Arc::clone(&self.registries.request);
        self.push_registered(registry, key, args)
    }

    /// Appends a response middleware by key, e.g. `raise_error` or `logger`.
    pub fn response(&mut self, key: &str, args: HandlerArgs) -> crate::Result<&mut Self> {
        let registry = Arc::clone(&self.registries.response);
        self.push_registered(registry, key, args)
    }

    /// Replaces the terminal adapter with one registered under `key`.
    pub fn adapter(&mut self, key: &str, args: HandlerArgs) -> crate::Result<&mut Self> {
        self.ensure_unlocked()?;
        let registry = Arc::clone(&self.registries.adapter);
        self.adapter = Some(HandlerDescriptor::from_key(registry, key, args)?);
        Ok(self)
    }

    /// Replaces the terminal adapter with a concrete class.
    pub fn adapter_class(
        &mut self,
        class: HandlerClass,
        args: HandlerArgs,
    ) -> crate::Result<&mut Self> {
        self.ensure_unlocked()?;
        if !class.is_adapter() {
            return Err(Error::InvalidHandler {
                handler: class.name().to_owned(),
                message: "only adapters can terminate a pipeline".to_owned(),
            });
        }
        self.adapter = Some(HandlerDescriptor::from_class(class, args));
        Ok(self)
    }

    pub fn insert_before(
        &mut self,
        target: impl Into<HandlerIndex>,
        class: HandlerClass,
        args: HandlerArgs,
    ) -> crate::Result<&mut Self> {
        self.ensure_unlocked()?;
        ensure_not_adapter(&class)?;
        let index = self.position(&target.into())?;
        self.handlers
            .insert(index, HandlerDescriptor::from_class(class, args));
        Ok(self)
    }

    pub fn insert_after(
        &mut self,
        target: impl Into<HandlerIndex>,
        class: HandlerClass,
        args: HandlerArgs,
    ) -> crate::Result<&mut Self> {
        self.ensure_unlocked()?;
        ensure_not_adapter(&class)?;
        let index = self.position(&target.into())?;
        self.handlers
            .insert(index + 1, HandlerDescriptor::from_class(class, args));
        Ok(self)
    }

    pub fn swap(
        &mut self,
        target: impl Into<HandlerIndex>,
        class: HandlerClass,
        args: HandlerArgs,
    ) -> crate::Result<&mut Self> {
        self.ensure_unlocked()?;
        ensure_not_adapter(&class)?;
        let index = self.position(&target.into())?;
        self.handlers[index] = HandlerDescriptor::from_class(class, args);
        Ok(self)
    }

    pub fn delete(&mut self, target: impl Into<HandlerIndex>) -> crate::Result<HandlerDescriptor> {
        self.ensure_unlocked()?;
        let index = self.position(&target.into())?;
        Ok(self.handlers.remove(index))
    }

    /// Clears the stack unless `keep`, hands it to `configure`, then fills in the default
    /// adapter if none was set.
    pub fn build<F>(&mut self, keep: bool, configure: F) -> crate::Result<&mut Self>
    where
        F: FnOnce(&mut Self) -> crate::Result<()>,
    {
        self.ensure_unlocked()?;
        if !keep {
            self.handlers.clear();
        }
        configure(self)?;
        if self.adapter.is_none() {
            let key = self.registries.default_adapter_key();
            self.adapter(&key, HandlerArgs::none())?;
        }
        Ok(self)
    }

    /// Composes the stack. The last added handler wraps the adapter directly.
    pub fn to_app(&self) -> crate::Result<App> {
        let Some(adapter) = &self.adapter else {
            return Err(Error::InvalidHandler {
                handler: "adapter".to_owned(),
                message: "no adapter configured".to_owned(),
            });
        };
        let mut app = adapter.build(None)?;
        for handler in self.handlers.iter().rev() {
            app = handler.build(Some(app))?;
        }
        Ok(app)
    }

    /// Locks the stack and returns the composed app, building it on first use.
    ///
    /// An empty stack gets the `url_encoded` request encoder; a missing adapter gets the default
    /// adapter.
    pub fn app(&mut self) -> crate::Result<App> {
        if let Some(app) = &self.app {
            return Ok(Arc::clone(app));
        }
        if !self.locked {
            if self.handlers.is_empty() && self.adapter.is_none() {
                self.request("url_encoded", HandlerArgs::none())?;
            }
            if self.adapter.is_none() {
                let key = self.registries.default_adapter_key();
                self.adapter(&key, HandlerArgs::none())?;
            }
        }
        self.lock();
        let app = self.to_app()?;
        self.app = Some(Arc::clone(&app));
        Ok(app)
    }

    /// An unlocked copy that can be modified independently.
    pub fn dup(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
            adapter: self.adapter.clone(),
            locked: false,
            registries: self.registries.clone(),
            app: None,
        }
    }

    fn push_registered(
        &mut self,
        registry: Arc<HandlerRegistry>,
        key: &str,
        args: HandlerArgs,
    ) -> crate::Result<&mut Self> {
        self.ensure_unlocked()?;
        let descriptor = HandlerDescriptor::from_key(registry, key, args)?;
        self.handlers.push(descriptor);
        Ok(self)
    }

    fn ensure_unlocked(&self) -> crate::Result<()> {
        if self.locked {
            return Err(Error::StackLocked);
        }
        Ok(())
    }

    fn position(&self, target: &HandlerIndex) -> crate::Result<usize> {
        let found = match target {
            HandlerIndex::Position(position) => {
                (*position < self.handlers.len()).then_some(*position)
            }
            HandlerIndex::Named(name) => self
                .handlers
                .iter()
                .position(|handler| handler.name() == name),
        };
        found.ok_or_else(|| Error::HandlerNotFound {
            target: target.to_string(),
        })
    }
}

fn ensure_not_adapter(class: &HandlerClass) -> crate::Result<()> {
    if class.is_adapter() {
        return Err(Error::InvalidHandler {
            handler: class.name().to_owned(),
            message: "adapters must be set with `adapter`, not inserted into the stack"
                .to_owned(),
        });
    }
    Ok(())
}
