use std::any::Any;
use std::sync::Arc;

use crate::env::Env;
use crate::error::Error;

/// A composed pipeline, or any stage of one.
pub type App = Arc<dyn Handler>;

pub trait Handler: Send + Sync {
    fn call(&self, env: &mut Env) -> crate::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&mut Env) -> crate::Result<()> + Send + Sync,
{
    fn call(&self, env: &mut Env) -> crate::Result<()> {
        self(env)
    }
}

/// Wraps a closure as a pipeline stage.
pub fn handler_fn<F>(handler: F) -> App
where
    F: Fn(&mut Env) -> crate::Result<()> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Pre/post hooks for middleware that does not need to control re-invocation of the inner app.
///
/// `on_complete` runs as soon as the inner app returns with a finished response. When the
/// response is still pending (parallel mode) it is queued on the env instead.
pub trait Middleware: Send + Sync + 'static {
    fn on_request(&self, _env: &mut Env) -> crate::Result<()> {
        Ok(())
    }

    fn on_complete(&self, _env: &mut Env) -> crate::Result<()> {
        Ok(())
    }

    fn on_error(&self, _env: &Env, _error: &Error) {}
}

pub(crate) struct Hooked<M: Middleware> {
    middleware: Arc<M>,
    app: App,
}

impl<M: Middleware> Hooked<M> {
    pub(crate) fn new(middleware: M, app: App) -> Self {
        Self {
            middleware: Arc::new(middleware),
            app,
        }
    }
}

impl<M: Middleware> Handler for Hooked<M> {
    fn call(&self, env: &mut Env) -> crate::Result<()> {
        let result = self
            .middleware
            .on_request(env)
            .and_then(|()| self.app.call(env));
        if let Err(error) = result {
            self.middleware.on_error(env, &error);
            return Err(error);
        }

        if env.response().is_finished() {
            return self.middleware.on_complete(env);
        }
        let middleware = Arc::clone(&self.middleware);
        env.on_complete(move |env| middleware.on_complete(env))
    }
}

/// Type-erased constructor arguments attached to a handler descriptor.
#[derive(Clone, Default)]
pub struct HandlerArgs(Option<Arc<dyn Any + Send + Sync>>);

impl std::fmt::Debug for HandlerArgs {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_tuple("HandlerArgs")
            .field(&self.0.is_some())
            .finish()
    }
}

impl HandlerArgs {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(Some(Arc::new(value)))
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.0.as_deref().and_then(|value| value.downcast_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerRole {
    Middleware,
    Adapter,
}

type MiddlewareBuild = dyn Fn(App, &HandlerArgs) -> crate::Result<App> + Send + Sync;
type AdapterBuild = dyn Fn(&HandlerArgs) -> crate::Result<App> + Send + Sync;

#[derive(Clone)]
enum Constructor {
    Middleware(Arc<MiddlewareBuild>),
    Adapter(Arc<AdapterBuild>),
    Unavailable { role: HandlerRole, message: String },
}

/// A named handler constructor: the unit the registries resolve keys to.
#[derive(Clone)]
pub struct HandlerClass {
    name: Arc<str>,
    constructor: Constructor,
}

impl std::fmt::Debug for HandlerClass {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HandlerClass")
            .field("name", &self.name)
            .field("role", &self.role())
            .field("available", &self.is_available())
            .finish()
    }
}

impl PartialEq for HandlerClass {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl HandlerClass {
    /// A middleware built around the inner app.
    pub fn middleware<F>(name: impl Into<Arc<str>>, build: F) -> Self
    where
        F: Fn(App, &HandlerArgs) -> crate::Result<App> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            constructor: Constructor::Middleware(Arc::new(build)),
        }
    }

    /// A middleware expressed as [`Middleware`] hooks.
    pub fn hooks<M, F>(name: impl Into<Arc<str>>, build: F) -> Self
    where
        M: Middleware,
        F: Fn(&HandlerArgs) -> crate::Result<M> + Send + Sync + 'static,
    {
        Self::middleware(name, move |app, args| {
            let middleware = build(args)?;
            Ok(Arc::new(Hooked::new(middleware, app)) as App)
        })
    }

    /// A terminal adapter.
    pub fn adapter<F>(name: impl Into<Arc<str>>, build: F) -> Self
    where
        F: Fn(&HandlerArgs) -> crate::Result<App> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            constructor: Constructor::Adapter(Arc::new(build)),
        }
    }

    /// A class whose backing dependency could not be loaded. Building it fails with
    /// [`Error::DependencyMissing`].
    pub fn unavailable(
        name: impl Into<Arc<str>>,
        role: HandlerRole,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            constructor: Constructor::Unavailable {
                role,
                message: message.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> HandlerRole {
        match &self.constructor {
            Constructor::Middleware(_) => HandlerRole::Middleware,
            Constructor::Adapter(_) => HandlerRole::Adapter,
            Constructor::Unavailable { role, .. } => *role,
        }
    }

    pub fn is_adapter(&self) -> bool {
        self.role() == HandlerRole::Adapter
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.constructor, Constructor::Unavailable { .. })
    }

    /// Instantiates the handler. Middleware requires `inner`; adapters ignore it.
    pub fn build(&self, inner: Option<App>, args: &HandlerArgs) -> crate::Result<App> {
        match &self.constructor {
            Constructor::Middleware(build) => {
                let Some(inner) = inner else {
                    return Err(Error::InvalidHandler {
                        handler: self.name.to_string(),
                        message: "middleware cannot terminate a pipeline".to_owned(),
                    });
                };
                build(inner, args)
            }
            Constructor::Adapter(build) => build(args),
            Constructor::Unavailable { message, .. } => Err(Error::DependencyMissing {
                handler: self.name.to_string(),
                message: message.clone(),
            }),
        }
    }
}
