use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::proxy::ProxySpec;

/// Receives `(chunk, cumulative_bytes)` for each body chunk an adapter reads.
pub type StreamingCallback = Arc<dyn Fn(&[u8], usize) + Send + Sync>;

/// How query parameters are serialized into a URL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParamsEncoder {
    /// `tag=a&tag=b`
    #[default]
    Flat,
    /// `tag[]=a&tag[]=b` for repeated keys.
    Nested,
}

impl ParamsEncoder {
    pub fn encode(self, params: &[(String, String)]) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in params {
            let repeated = params.iter().filter(|(other, _)| other == name).count() > 1;
            if self == Self::Nested && repeated && !name.ends_with("[]") {
                serializer.append_pair(&format!("{name}[]"), value);
            } else {
                serializer.append_pair(name, value);
            }
        }
        serializer.finish()
    }
}

#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub open_timeout: Option<Duration>,
    pub proxy: Option<ProxySpec>,
    pub params_encoder: ParamsEncoder,
    pub on_data: Option<StreamingCallback>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("open_timeout", &self.open_timeout)
            .field("proxy", &self.proxy)
            .field("params_encoder", &self.params_encoder)
            .field("on_data", &self.on_data.is_some())
            .finish()
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = Some(open_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySpec) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_params_encoder(mut self, params_encoder: ParamsEncoder) -> Self {
        self.params_encoder = params_encoder;
        self
    }

    pub fn with_on_data<F>(mut self, on_data: F) -> Self
    where
        F: Fn(&[u8], usize) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(on_data));
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SslOptions {
    pub verify: bool,
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl Default for SslOptions {
    fn default() -> Self {
        Self {
            verify: true,
            ca_file: None,
            client_cert: None,
            client_key: None,
        }
    }
}

impl SslOptions {
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn ca_file(mut self, ca_file: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(ca_file.into());
        self
    }

    pub fn client_identity(
        mut self,
        client_cert: impl Into<PathBuf>,
        client_key: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert = Some(client_cert.into());
        self.client_key = Some(client_key.into());
        self
    }
}
