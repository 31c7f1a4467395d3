use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::ureq::tls::{Certificate, ClientCert, PemItem, PrivateKey, RootCerts, TlsConfig};
use ::ureq::{Agent, Proxy};
use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderValue, Method};
use tracing::debug;

use crate::config::SslOptions;
use crate::env::Env;
use crate::error::Error;
use crate::handler::{App, Handler, HandlerArgs, HandlerClass};
use crate::proxy::ProxySpec;
use crate::util::{lock_unpoisoned, redact_url_for_logs};

const READ_CHUNK_SIZE: usize = 8192;

/// Agent construction settings for [`UreqAdapter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UreqOptions {
    pub user_agent: String,
    pub max_idle_connections: usize,
    pub max_idle_connections_per_host: usize,
    pub max_idle_age: Duration,
}

impl Default for UreqOptions {
    fn default() -> Self {
        Self {
            user_agent: concat!("reqchain/", env!("CARGO_PKG_VERSION")).to_owned(),
            max_idle_connections: 32,
            max_idle_connections_per_host: 8,
            max_idle_age: Duration::from_secs(90),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AgentKey {
    proxy: Option<String>,
    ssl: SslOptions,
}

/// Blocking adapter backed by `ureq`. Agents are cached per proxy and TLS configuration.
pub struct UreqAdapter {
    options: UreqOptions,
    agents: Mutex<HashMap<AgentKey, Agent>>,
}

impl UreqAdapter {
    pub fn new(options: UreqOptions) -> Self {
        Self {
            options,
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub fn class() -> HandlerClass {
        HandlerClass::adapter("ureq", |args: &HandlerArgs| {
            let options = args.get::<UreqOptions>().cloned().unwrap_or_default();
            Ok(Arc::new(UreqAdapter::new(options)) as App)
        })
    }

    fn agent(&self, proxy_spec: Option<&ProxySpec>, ssl: &SslOptions) -> crate::Result<Agent> {
        let key = AgentKey {
            proxy: proxy_spec.map(|spec| spec.uri_with_credentials().to_string()),
            ssl: ssl.clone(),
        };
        let mut agents = lock_unpoisoned(&self.agents);
        if let Some(agent) = agents.get(&key) {
            return Ok(agent.clone());
        }

        let proxy = match &key.proxy {
            Some(uri) => Some(Proxy::new(uri).map_err(|_| Error::InvalidProxy {
                uri: proxy_spec
                    .map(|spec| spec.uri().to_string())
                    .unwrap_or_default(),
            })?),
            None => None,
        };
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .user_agent(self.options.user_agent.as_str())
            .max_idle_age(self.options.max_idle_age)
            .max_idle_connections(self.options.max_idle_connections)
            .max_idle_connections_per_host(self.options.max_idle_connections_per_host)
            .tls_config(build_tls_config(ssl)?)
            .proxy(proxy)
            .build()
            .new_agent();
        agents.insert(key, agent.clone());
        Ok(agent)
    }
}

fn tls_error(message: String) -> Error {
    Error::handler("ureq", message)
}

fn read_pem(path: &std::path::Path) -> crate::Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::ReadBody { source })
}

fn parse_pem_certificates(pem: &[u8], context: &str) -> crate::Result<Vec<Certificate<'static>>> {
    let mut certificates = Vec::new();
    for item in ::ureq::tls::parse_pem(pem) {
        let item =
            item.map_err(|source| tls_error(format!("failed to parse PEM {context}: {source}")))?;
        if let PemItem::Certificate(certificate) = item {
            certificates.push(certificate);
        }
    }
    if certificates.is_empty() {
        return Err(tls_error(format!("no certificate blocks found in PEM {context}")));
    }
    Ok(certificates)
}

fn build_tls_config(ssl: &SslOptions) -> crate::Result<TlsConfig> {
    let mut builder = TlsConfig::builder().disable_verification(!ssl.verify);

    if let Some(ca_file) = &ssl.ca_file {
        let ca_pem = read_pem(ca_file)?;
        let roots = parse_pem_certificates(&ca_pem, "ca file")?;
        builder = builder.root_certs(RootCerts::new_with_certs(&roots));
    }

    if let (Some(cert_path), Some(key_path)) = (&ssl.client_cert, &ssl.client_key) {
        let cert_pem = read_pem(cert_path)?;
        let key_pem = read_pem(key_path)?;
        let chain = parse_pem_certificates(&cert_pem, "client certificate")?;
        let key = PrivateKey::from_pem(&key_pem)
            .map_err(|source| tls_error(format!("failed to parse client key PEM: {source}")))?;
        builder = builder.client_cert(Some(ClientCert::new_with_certs(&chain, key)));
    }

    Ok(builder.build())
}

fn is_connect_failure(error: &::ureq::Error) -> bool {
    match error {
        ::ureq::Error::HostNotFound
        | ::ureq::Error::ConnectionFailed
        | ::ureq::Error::ConnectProxyFailed(_) => true,
        ::ureq::Error::Io(source) => matches!(
            source.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::AddrNotAvailable
        ),
        _ => false,
    }
}

fn map_ureq_error(error: ::ureq::Error, env: &Env) -> Error {
    let method = env.method().clone();
    let uri = redact_url_for_logs(env.url());
    match error {
        ::ureq::Error::Timeout(_) => Error::Timeout {
            timeout_ms: effective_timeout(env).as_millis(),
            method,
            uri,
        },
        error if is_connect_failure(&error) => Error::ConnectionFailed {
            method,
            uri,
            source: Box::new(error),
        },
        error => Error::Transport {
            method,
            uri,
            source: Box::new(error),
        },
    }
}

fn effective_timeout(env: &Env) -> Duration {
    env.options()
        .timeout
        .or(env.options().open_timeout)
        .unwrap_or_default()
}

fn map_read_error(source: std::io::Error, env: &Env) -> Error {
    let wrapped_timeout = matches!(
        source
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<::ureq::Error>()),
        Some(::ureq::Error::Timeout(_))
    );
    if wrapped_timeout || source.kind() == std::io::ErrorKind::TimedOut {
        return Error::Timeout {
            timeout_ms: effective_timeout(env).as_millis(),
            method: env.method().clone(),
            uri: redact_url_for_logs(env.url()),
        };
    }
    Error::ReadBody { source }
}

impl Handler for UreqAdapter {
    fn call(&self, env: &mut Env) -> crate::Result<()> {
        let agent = self.agent(env.options().proxy.as_ref(), env.ssl())?;
        let body = super::request_bytes(env)?;

        let mut builder = ::ureq::http::Request::builder()
            .method(env.method().clone())
            .uri(env.url().as_str());
        for (name, value) in env.request_headers() {
            builder = builder.header(name, value);
        }
        if env.needs_body() && !env.request_headers().contains_key(CONTENT_LENGTH) {
            builder = builder.header(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
        let request = builder
            .body(body.to_vec())
            .map_err(|source| Error::RequestBuild { source })?;

        let mut configured = agent.configure_request(request);
        if let Some(timeout) = env.options().timeout {
            configured = configured
                .timeout_global(Some(timeout))
                .timeout_recv_response(Some(timeout))
                .timeout_recv_body(Some(timeout));
        }
        if let Some(open_timeout) = env.options().open_timeout {
            configured = configured.timeout_connect(Some(open_timeout));
        }
        let request = configured.build();

        debug!(
            method = %env.method(),
            url = %redact_url_for_logs(env.url()),
            proxied = env.options().proxy.is_some(),
            "sending request"
        );
        let mut response = agent
            .run(request)
            .map_err(|error| map_ureq_error(error, env))?;

        let status = response.status();
        let headers = response.headers().clone();
        let reason = status.canonical_reason().map(str::to_owned);
        let head_request = *env.method() == Method::HEAD;

        let mut reader = response.body_mut().as_reader();
        let mut collected = Vec::new();
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        let streaming = env.stream_response();
        if !head_request {
            loop {
                let read = reader
                    .read(&mut chunk)
                    .map_err(|source| map_read_error(source, env))?;
                if read == 0 {
                    break;
                }
                if streaming {
                    env.stream_chunk(&chunk[..read]);
                } else {
                    collected.extend_from_slice(&chunk[..read]);
                }
            }
        }
        if streaming {
            env.finish_stream();
        }

        env.save_response(status, headers, Bytes::from(collected), reason)
    }
}
