use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use http::{HeaderMap, Method};
use tracing::debug;
use url::Url;

use crate::body::RequestBody;
use crate::builder::PipelineBuilder;
use crate::config::{ParamsEncoder, RequestOptions, SslOptions};
use crate::env::Env;
use crate::error::Error;
use crate::handler::App;
use crate::proxy::{ProxySelector, ProxySpec};
use crate::registry::Registries;
use crate::response::Response;
use crate::util::{lock_unpoisoned, parse_header_name, parse_header_value};

/// Where a connection gets its proxy from.
#[derive(Clone, Debug, Default, PartialEq)]
enum ProxySource {
    #[default]
    Environment,
    Explicit(ProxySelector),
    Disabled,
}

pub struct ConnectionBuilder {
    url_prefix: String,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    options: RequestOptions,
    ssl: SslOptions,
    proxy: ProxySource,
    pipeline: Option<PipelineBuilder>,
    registries: Registries,
}

impl std::fmt::Debug for ConnectionBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ConnectionBuilder")
            .field("url_prefix", &self.url_prefix)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("options", &self.options)
            .field("proxy", &self.proxy)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl ConnectionBuilder {
    fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            url_prefix: url_prefix.into(),
            headers: HeaderMap::new(),
            params: Vec::new(),
            options: RequestOptions::default(),
            ssl: SslOptions::default(),
            proxy: ProxySource::Environment,
            pipeline: None,
            registries: Registries::global(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        let header_name = parse_header_name(name)?;
        let header_value = parse_header_value(name, value)?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }

    pub fn open_timeout(mut self, open_timeout: Duration) -> Self {
        self.options = self.options.with_open_timeout(open_timeout);
        self
    }

    pub fn params_encoder(mut self, params_encoder: ParamsEncoder) -> Self {
        self.options = self.options.with_params_encoder(params_encoder);
        self
    }

    pub fn on_data<F>(mut self, on_data: F) -> Self
    where
        F: Fn(&[u8], usize) + Send + Sync + 'static,
    {
        self.options = self.options.with_on_data(on_data);
        self
    }

    pub fn ssl(mut self, ssl: SslOptions) -> Self {
        self.ssl = ssl;
        self
    }

    /// Sends every request through `proxy`.
    pub fn proxy(mut self, proxy: ProxySpec) -> Self {
        self.proxy = ProxySource::Explicit(ProxySelector::single(proxy));
        self
    }

    pub fn proxy_selector(mut self, selector: ProxySelector) -> Self {
        self.proxy = ProxySource::Explicit(selector);
        self
    }

    /// Ignores `http_proxy`/`https_proxy` for this connection.
    pub fn no_proxy(mut self) -> Self {
        self.proxy = ProxySource::Disabled;
        self
    }

    /// Registries consulted by the pipeline when it is created from scratch.
    pub fn registries(mut self, registries: Registries) -> Self {
        self.registries = registries;
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineBuilder) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Configures the handler stack in place.
    pub fn configure<F>(mut self, configure: F) -> crate::Result<Self>
    where
        F: FnOnce(&mut PipelineBuilder) -> crate::Result<()>,
    {
        let registries = self.registries.clone();
        let pipeline = self
            .pipeline
            .get_or_insert_with(|| PipelineBuilder::with_registries(registries));
        pipeline.build(true, configure)?;
        Ok(self)
    }

    pub fn try_build(self) -> crate::Result<Connection> {
        let url_prefix = parse_url_prefix(&self.url_prefix)?;
        let proxy = match self.proxy {
            ProxySource::Environment => Some(ProxySelector::from_env()),
            ProxySource::Explicit(selector) => Some(selector),
            ProxySource::Disabled => None,
        };
        let pipeline = self
            .pipeline
            .unwrap_or_else(|| PipelineBuilder::with_registries(self.registries));
        Ok(Connection {
            url_prefix,
            headers: self.headers,
            params: self.params,
            options: self.options,
            ssl: self.ssl,
            proxy,
            pipeline: Mutex::new(pipeline),
            app: OnceLock::new(),
        })
    }
}

fn parse_url_prefix(text: &str) -> crate::Result<Url> {
    let trimmed = text.trim();
    let url = Url::parse(trimmed).map_err(|_| Error::InvalidUri {
        uri: trimmed.to_owned(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::InvalidUri {
            uri: trimmed.to_owned(),
        });
    }
    Ok(url)
}

/// A base URL, request defaults and a handler stack.
///
/// The stack stays editable through [`Connection::pipeline`] until the first request composes
/// and locks it.
pub struct Connection {
    url_prefix: Url,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    options: RequestOptions,
    ssl: SslOptions,
    proxy: Option<ProxySelector>,
    pipeline: Mutex<PipelineBuilder>,
    app: OnceLock<App>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("url_prefix", &self.url_prefix.as_str())
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("options", &self.options)
            .field("proxy", &self.proxy)
            .field("composed", &self.app.get().is_some())
            .finish()
    }
}

impl Connection {
    pub fn builder(url_prefix: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(url_prefix)
    }

    pub fn url_prefix(&self) -> &Url {
        &self.url_prefix
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn ssl(&self) -> &SslOptions {
        &self.ssl
    }

    pub fn proxy_selector(&self) -> Option<&ProxySelector> {
        self.proxy.as_ref()
    }

    /// Runs `edit` against the handler stack. Fails with [`Error::StackLocked`] once a request
    /// has been dispatched.
    pub fn pipeline<F, T>(&self, edit: F) -> crate::Result<T>
    where
        F: FnOnce(&mut PipelineBuilder) -> crate::Result<T>,
    {
        let mut pipeline = lock_unpoisoned(&self.pipeline);
        if pipeline.is_locked() {
            return Err(Error::StackLocked);
        }
        edit(&mut *pipeline)
    }

    /// Snapshot of the handler stack.
    pub fn pipeline_snapshot(&self) -> PipelineBuilder {
        lock_unpoisoned(&self.pipeline).clone()
    }

    /// Joins `path` onto the prefix and appends connection and request params.
    ///
    /// Absolute `http`/`https` URLs replace the prefix.
    pub fn build_url(&self, path: &str, params: &[(String, String)]) -> crate::Result<Url> {
        let mut url = match Url::parse(path) {
            Ok(absolute) if matches!(absolute.scheme(), "http" | "https") => absolute,
            Ok(_) => {
                return Err(Error::InvalidUri {
                    uri: path.to_owned(),
                });
            }
            Err(_) => join_prefix(&self.url_prefix, path)?,
        };

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        for (name, value) in self.params.iter().chain(params) {
            pairs.retain(|(existing, _)| existing != name || params_repeat(params, name));
            pairs.push((name.clone(), value.clone()));
        }
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&self.options.params_encoder.encode(&pairs)));
        }
        Ok(url)
    }

    pub fn get(&self, path: &str) -> crate::Result<Response> {
        self.run_request(Method::GET, path, RequestBody::Empty, HeaderMap::new())
    }

    pub fn head(&self, path: &str) -> crate::Result<Response> {
        self.run_request(Method::HEAD, path, RequestBody::Empty, HeaderMap::new())
    }

    pub fn delete(&self, path: &str) -> crate::Result<Response> {
        self.run_request(Method::DELETE, path, RequestBody::Empty, HeaderMap::new())
    }

    pub fn options_request(&self, path: &str) -> crate::Result<Response> {
        self.run_request(Method::OPTIONS, path, RequestBody::Empty, HeaderMap::new())
    }

    pub fn post(&self, path: &str, body: impl Into<RequestBody>) -> crate::Result<Response> {
        self.run_request(Method::POST, path, body.into(), HeaderMap::new())
    }

    pub fn put(&self, path: &str, body: impl Into<RequestBody>) -> crate::Result<Response> {
        self.run_request(Method::PUT, path, body.into(), HeaderMap::new())
    }

    pub fn patch(&self, path: &str, body: impl Into<RequestBody>) -> crate::Result<Response> {
        self.run_request(Method::PATCH, path, body.into(), HeaderMap::new())
    }

    /// Builds an env from the connection defaults, dispatches it and returns the response.
    pub fn run_request(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        headers: HeaderMap,
    ) -> crate::Result<Response> {
        let env = self.build_env(method, path, body, headers)?;
        self.dispatch(env).map(Env::into_response)
    }

    /// Like [`Connection::run_request`] but hands back the whole env, including extensions.
    pub fn dispatch(&self, mut env: Env) -> crate::Result<Env> {
        let app = self.app()?;
        app.call(&mut env)?;
        Ok(env)
    }

    pub fn build_env(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        headers: HeaderMap,
    ) -> crate::Result<Env> {
        if !SUPPORTED_METHODS.contains(&method) {
            return Err(Error::UnsupportedMethod { method });
        }
        let url = self.build_url(path, &[])?;
        let mut merged = self.headers.clone();
        for name in headers.keys() {
            merged.remove(name);
            for value in headers.get_all(name) {
                merged.append(name.clone(), value.clone());
            }
        }

        let mut options = self.options.clone();
        if options.proxy.is_none()
            && let Some(selector) = &self.proxy
        {
            options.proxy = selector.proxy_for(&url);
        }

        Ok(Env::new(method, url)
            .with_headers(merged)
            .with_body(body)
            .with_options(options)
            .with_ssl(self.ssl.clone()))
    }

    /// The composed app. The first call fills in defaults and locks the stack.
    pub fn app(&self) -> crate::Result<App> {
        if let Some(app) = self.app.get() {
            return Ok(Arc::clone(app));
        }
        let mut pipeline = lock_unpoisoned(&self.pipeline);
        if let Some(app) = self.app.get() {
            return Ok(Arc::clone(app));
        }
        let app = pipeline.app()?;
        debug!(handlers = ?pipeline.handler_names(), "composed connection pipeline");
        let _ = self.app.set(Arc::clone(&app));
        Ok(app)
    }
}

const SUPPORTED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
];

fn params_repeat(params: &[(String, String)], name: &str) -> bool {
    params.iter().filter(|(other, _)| other == name).count() > 1
}

fn join_prefix(prefix: &Url, path: &str) -> crate::Result<Url> {
    let (path_part, query) = match path.split_once('?') {
        Some((path_part, query)) => (path_part, Some(query)),
        None => (path, None),
    };
    let base = prefix.path().trim_end_matches('/');
    let relative = path_part.trim_start_matches('/');
    let joined = match (base.is_empty(), relative.is_empty()) {
        (_, true) => prefix.path().to_owned(),
        (true, false) => format!("/{relative}"),
        (false, false) => format!("{base}/{relative}"),
    };

    let mut url = prefix.clone();
    url.set_path(&joined);
    url.set_fragment(None);
    match query {
        Some(query) => url.set_query(Some(query)),
        None => url.set_query(prefix.query()),
    }
    if url.host_str().is_none() {
        return Err(Error::InvalidUri {
            uri: path.to_owned(),
        });
    }
    Ok(url)
}
