use std::sync::Arc;
use std::time::Instant;

use http::HeaderMap;
use http::header::{AUTHORIZATION, COOKIE, HeaderName, PROXY_AUTHORIZATION, SET_COOKIE};
use tracing::{debug, info, info_span, warn};

use crate::env::{Body, Env};
use crate::handler::{App, Handler, HandlerArgs, HandlerClass};
use crate::util::{redact_url_for_logs, truncate_body};

/// What the `logger` response middleware includes besides method, URL and status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoggerOptions {
    pub headers: bool,
    pub bodies: bool,
}

impl LoggerOptions {
    pub fn headers(mut self, headers: bool) -> Self {
        self.headers = headers;
        self
    }

    pub fn bodies(mut self, bodies: bool) -> Self {
        self.bodies = bodies;
        self
    }
}

/// Emits one `tracing` event per request and one per completed response.
pub struct Logger {
    app: App,
    options: LoggerOptions,
}

impl Logger {
    pub fn new(app: App, options: LoggerOptions) -> Self {
        Self { app, options }
    }
}

const REDACTED_HEADERS: [HeaderName; 4] = [AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE, SET_COOKIE];

/// Credential headers and values flagged sensitive are masked.
fn header_summary(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            let text = if value.is_sensitive() || REDACTED_HEADERS.contains(name) {
                "<redacted>"
            } else {
                value.to_str().unwrap_or("<binary>")
            };
            format!("{name}: {text}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn log_response(env: &Env, options: LoggerOptions, started: Instant) {
    let status = env.status().map(|status| status.as_u16()).unwrap_or_default();
    info!(
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "response"
    );
    if options.headers {
        debug!(headers = %header_summary(env.response().headers()), "response headers");
    }
    if options.bodies
        && let Body::Response(Some(body)) = env.body()
    {
        debug!(body = %truncate_body(body), "response body");
    }
}

impl Handler for Logger {
    fn call(&self, env: &mut Env) -> crate::Result<()> {
        let span = info_span!(
            "reqchain.request",
            method = %env.method(),
            url = %redact_url_for_logs(env.url())
        );
        let _enter = span.enter();
        let started = Instant::now();

        info!("request");
        if self.options.headers {
            debug!(headers = %header_summary(env.request_headers()), "request headers");
        }
        if self.options.bodies
            && let Some(body) = env.request_body().as_bytes()
        {
            debug!(body = %truncate_body(body), "request body");
        }

        if let Err(error) = self.app.call(env) {
            warn!(error = %error, code = %error.code(), "request failed");
            return Err(error);
        }

        if env.response().is_finished() {
            log_response(env, self.options, started);
            return Ok(());
        }
        let options = self.options;
        let completion_span = span.clone();
        env.on_complete(move |env| {
            let _enter = completion_span.enter();
            log_response(env, options, started);
            Ok(())
        })
    }
}

pub fn logger_class() -> HandlerClass {
    HandlerClass::middleware("logger", |app, args: &HandlerArgs| {
        let options = args.get::<LoggerOptions>().copied().unwrap_or_default();
        Ok(Arc::new(Logger::new(app, options)) as App)
    })
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;
    use http::header::{
        AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderValue, PROXY_AUTHORIZATION, SET_COOKIE,
    };

    use super::header_summary;

    #[test]
    fn header_summary_masks_sensitive_values() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let mut secret = HeaderValue::from_static("Bearer token");
        secret.set_sensitive(true);
        headers.insert(AUTHORIZATION, secret);

        let summary = header_summary(&headers);
        assert!(summary.contains("content-type: text/plain"));
        assert!(summary.contains("authorization: <redacted>"));
        assert!(!summary.contains("token"));
    }

    #[test]
    fn header_summary_masks_credential_headers_by_name() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic cHJveHk="));
        headers.insert(COOKIE, HeaderValue::from_static("session=abc123"));
        headers.insert(SET_COOKIE, HeaderValue::from_static("session=def456"));
        headers.insert("x-request-id", HeaderValue::from_static("req-1"));

        let summary = header_summary(&headers);
        assert!(summary.contains("x-request-id: req-1"));
        for secret in ["dXNlcjpwYXNz", "cHJveHk=", "abc123", "def456"] {
            assert!(!summary.contains(secret), "{secret} leaked in {summary}");
        }
        assert_eq!(summary.matches("<redacted>").count(), 4);
    }
}
