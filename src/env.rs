use bytes::Bytes;
use http::{Extensions, HeaderMap, Method, StatusCode};
use url::Url;

use crate::body::RequestBody;
use crate::config::{RequestOptions, SslOptions};
use crate::error::Error;
use crate::response::Response;

pub type CompletionCallback = Box<dyn FnOnce(&mut Env) -> crate::Result<()> + Send>;

/// What [`Env::body`] currently refers to.
#[derive(Clone, Copy, Debug)]
pub enum Body<'a> {
    Request(&'a RequestBody),
    Response(Option<&'a Bytes>),
}

/// Mutable per-request context threaded through every handler of a pipeline.
pub struct Env {
    method: Method,
    url: Url,
    request_headers: HeaderMap,
    request_body: RequestBody,
    options: RequestOptions,
    ssl: SslOptions,
    response: Response,
    completion_callbacks: Vec<CompletionCallback>,
    extensions: Extensions,
    parallel: bool,
    streamed_bytes: usize,
    stream_started: bool,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Env")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("request_headers", &self.request_headers)
            .field("request_body", &self.request_body)
            .field("options", &self.options)
            .field("response", &self.response)
            .field("queued_callbacks", &self.completion_callbacks.len())
            .field("parallel", &self.parallel)
            .finish()
    }
}

impl Env {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            request_headers: HeaderMap::new(),
            request_body: RequestBody::Empty,
            options: RequestOptions::default(),
            ssl: SslOptions::default(),
            response: Response::default(),
            completion_callbacks: Vec::new(),
            extensions: Extensions::new(),
            parallel: false,
            streamed_bytes: 0,
            stream_started: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.request_headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.request_body = body.into();
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_ssl(mut self, ssl: SslOptions) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    pub fn request_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.request_headers
    }

    pub fn request_body(&self) -> &RequestBody {
        &self.request_body
    }

    pub fn set_request_body(&mut self, body: impl Into<RequestBody>) {
        self.request_body = body.into();
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut RequestOptions {
        &mut self.options
    }

    pub fn ssl(&self) -> &SslOptions {
        &self.ssl
    }

    pub fn ssl_mut(&mut self) -> &mut SslOptions {
        &mut self.ssl
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response.status()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Request body until the response is finished, response body afterwards.
    pub fn body(&self) -> Body<'_> {
        if self.response.is_finished() {
            Body::Response(self.response.body())
        } else {
            Body::Request(&self.request_body)
        }
    }

    pub fn success(&self) -> bool {
        self.response.is_success()
    }

    /// True when the request carries no body but its method expects one, so adapters should
    /// send an explicit zero `Content-Length`.
    pub fn needs_body(&self) -> bool {
        self.request_body.is_empty()
            && matches!(
                self.method,
                Method::POST | Method::PUT | Method::PATCH | Method::OPTIONS
            )
    }

    pub fn stream_response(&self) -> bool {
        self.options.on_data.is_some()
    }

    pub fn parallel(&self) -> bool {
        self.parallel
    }

    /// In parallel mode adapters save responses without finishing them; an external manager
    /// calls [`Env::finish`] later.
    pub fn set_parallel(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    pub fn on_complete<F>(&mut self, callback: F) -> crate::Result<()>
    where
        F: FnOnce(&mut Env) -> crate::Result<()> + Send + 'static,
    {
        if self.response.is_finished() {
            return callback(self);
        }
        self.completion_callbacks.push(Box::new(callback));
        Ok(())
    }

    pub fn finish(&mut self) -> crate::Result<()> {
        if self.response.is_finished() {
            return Err(Error::AlreadyFinished);
        }
        self.response.mark_finished();
        let callbacks = std::mem::take(&mut self.completion_callbacks);
        for callback in callbacks {
            callback(self)?;
        }
        Ok(())
    }

    /// Installs a fresh response and finishes it unless the env runs in parallel mode.
    pub fn save_response(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        reason_phrase: Option<String>,
    ) -> crate::Result<()> {
        self.response = Response::new(status, headers, body, reason_phrase);
        if self.parallel {
            return Ok(());
        }
        self.finish()
    }

    /// Drops any response from an earlier attempt. Queued completion callbacks are kept.
    pub fn reset_response(&mut self) {
        self.response = Response::default();
        self.streamed_bytes = 0;
        self.stream_started = false;
    }

    /// Forwards one body chunk to the streaming callback, tracking the cumulative size.
    pub fn stream_chunk(&mut self, chunk: &[u8]) {
        let Some(on_data) = self.options.on_data.clone() else {
            return;
        };
        self.streamed_bytes = self.streamed_bytes.saturating_add(chunk.len());
        self.stream_started = true;
        on_data(chunk, self.streamed_bytes);
    }

    /// Ends a streamed body. An empty body still produces one `(b"", 0)` callback.
    pub fn finish_stream(&mut self) {
        if self.stream_started {
            return;
        }
        if let Some(on_data) = self.options.on_data.clone() {
            self.stream_started = true;
            on_data(&[], 0);
        }
    }

    pub fn streamed_bytes(&self) -> usize {
        self.streamed_bytes
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}
