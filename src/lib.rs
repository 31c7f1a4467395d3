//! `reqchain` is a blocking HTTP client built from a composable handler stack.
//!
//! Request middleware, response middleware and a terminal adapter are registered by key,
//! resolved lazily, and folded into a single [`App`] the first time a request is dispatched.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqchain::StatusMatcher;
//! use reqchain::prelude::{Connection, HandlerArgs, RetryOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::builder("https://api.example.com/v1")
//!         .timeout(Duration::from_secs(5))
//!         .configure(|pipeline| {
//!             pipeline.request("json", HandlerArgs::none())?;
//!             pipeline.request(
//!                 "retry",
//!                 HandlerArgs::new(
//!                     RetryOptions::new()
//!                         .max(3)
//!                         .interval(Duration::from_millis(100))
//!                         .backoff_factor(2.0)
//!                         .retry_statuses([
//!                             StatusMatcher::from(429_u16),
//!                             StatusMatcher::from(500_u16..=599),
//!                         ]),
//!                 ),
//!             )?;
//!             pipeline.response("raise_error", HandlerArgs::none())?;
//!             Ok(())
//!         })?
//!         .try_build()?;
//!
//!     let response = connection.post("/items", serde_json::json!({ "name": "demo" }))?;
//!     println!("status={:?}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! # Defaults
//!
//! - An empty stack dispatches through `url_encoded` and the default adapter.
//! - The default adapter is `ureq` with the `ureq` feature enabled, `test` otherwise.
//! - Proxies come from `http_proxy`, `https_proxy` and `no_proxy` unless set explicitly.

pub mod adapter;
mod body;
mod builder;
mod config;
mod connection;
mod encoders;
mod env;
mod error;
pub mod facade;
mod handler;
mod logger;
mod proxy;
mod registry;
mod response;
mod retry;
mod util;

pub use crate::body::{ParamValue, ReadSeek, RequestBody, UploadIo};
pub use crate::builder::{HandlerDescriptor, HandlerIndex, PipelineBuilder};
pub use crate::config::{ParamsEncoder, RequestOptions, SslOptions, StreamingCallback};
pub use crate::connection::{Connection, ConnectionBuilder};
pub use crate::encoders::{
    Authorization, AuthorizationHeader, JsonRequest, JsonResponse, ParsedJson, RaiseError,
    UrlEncoded,
};
pub use crate::env::{Body, CompletionCallback, Env};
pub use crate::error::{Error, ErrorCode};
pub use crate::handler::{
    App, Handler, HandlerArgs, HandlerClass, HandlerRole, Middleware, handler_fn,
};
pub use crate::logger::{Logger, LoggerOptions};
pub use crate::proxy::{EnvironmentProxies, NoProxy, ProxySelector, ProxySpec};
pub use crate::registry::{
    ClassFactory, HandlerRegistry, Loader, Namespace, Registration, Registries, default_adapter,
    set_default_adapter,
};
pub use crate::response::Response;
pub use crate::retry::{
    ExhaustedRetriesBlock, Retry, RetryBlock, RetryContext, RetryIf, RetryOptions, RetryReason,
    StatusMatcher,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::adapter::test::{StubResponse, Stubs};
    pub use crate::{
        App, Authorization, Connection, Env, Error, ErrorCode, Handler, HandlerArgs, HandlerClass,
        Middleware, PipelineBuilder, ProxySelector, ProxySpec, RequestBody, Response, Result,
        RetryOptions, handler_fn,
    };
}
