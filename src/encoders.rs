use base64::prelude::*;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use tracing::debug;

use crate::body::{ParamValue, RequestBody};
use crate::env::Env;
use crate::error::Error;
use crate::handler::{HandlerArgs, HandlerClass, Middleware};
use crate::util::{redact_url_for_logs, truncate_body};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json";

fn set_default_content_type(env: &mut Env, value: &'static str) {
    env.request_headers_mut()
        .entry(CONTENT_TYPE)
        .or_insert_with(|| HeaderValue::from_static(value));
}

/// Serializes text params into a form body.
#[derive(Clone, Copy, Debug, Default)]
pub struct UrlEncoded;

impl Middleware for UrlEncoded {
    fn on_request(&self, env: &mut Env) -> crate::Result<()> {
        let RequestBody::Params(params) = env.request_body() else {
            return Ok(());
        };
        let mut pairs = Vec::with_capacity(params.len());
        for (name, value) in params {
            match value {
                ParamValue::Text(text) => pairs.push((name.as_str(), text.as_str())),
                ParamValue::File(_) => {
                    debug!(param = %name, "file part present; leaving params unencoded");
                    return Ok(());
                }
            }
        }

        let encoded = serde_urlencoded::to_string(&pairs)
            .map_err(|source| Error::SerializeForm { source })?;
        env.set_request_body(Bytes::from(encoded));
        set_default_content_type(env, FORM_CONTENT_TYPE);
        Ok(())
    }
}

pub fn url_encoded_class() -> HandlerClass {
    HandlerClass::hooks("url_encoded", |_| Ok(UrlEncoded))
}

/// Serializes a JSON value body.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonRequest;

impl Middleware for JsonRequest {
    fn on_request(&self, env: &mut Env) -> crate::Result<()> {
        let RequestBody::Json(value) = env.request_body() else {
            return Ok(());
        };
        let body = serde_json::to_vec(value).map_err(|source| Error::SerializeJson { source })?;
        env.set_request_body(Bytes::from(body));
        set_default_content_type(env, JSON_CONTENT_TYPE);
        Ok(())
    }
}

pub fn json_request_class() -> HandlerClass {
    HandlerClass::hooks("json_request", |_| Ok(JsonRequest))
}

/// Credentials applied by the `authorization` request middleware.
#[derive(Clone, PartialEq, Eq)]
pub enum Authorization {
    Basic { user: String, password: String },
    Bearer(String),
    /// Sent verbatim, e.g. `Token abc`.
    Raw(String),
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self {
            Self::Basic { .. } => "Basic",
            Self::Bearer(_) => "Bearer",
            Self::Raw(_) => "Raw",
        };
        formatter
            .debug_tuple("Authorization")
            .field(&scheme)
            .finish()
    }
}

impl Authorization {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    pub fn header_value(&self) -> crate::Result<HeaderValue> {
        let text = match self {
            Self::Basic { user, password } => {
                format!("Basic {}", BASE64_STANDARD.encode(format!("{user}:{password}")))
            }
            Self::Bearer(token) => format!("Bearer {token}"),
            Self::Raw(value) => value.clone(),
        };
        let mut value = HeaderValue::from_str(&text).map_err(|source| {
            Error::InvalidHeaderValue {
                name: AUTHORIZATION.as_str().to_owned(),
                source,
            }
        })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Sets `Authorization` unless the request already carries one.
#[derive(Clone, Debug)]
pub struct AuthorizationHeader {
    value: HeaderValue,
}

impl Middleware for AuthorizationHeader {
    fn on_request(&self, env: &mut Env) -> crate::Result<()> {
        env.request_headers_mut()
            .entry(AUTHORIZATION)
            .or_insert_with(|| self.value.clone());
        Ok(())
    }
}

pub fn authorization_class() -> HandlerClass {
    HandlerClass::hooks("authorization", |args: &HandlerArgs| {
        let credentials = args
            .get::<Authorization>()
            .ok_or_else(|| Error::InvalidHandler {
                handler: "authorization".to_owned(),
                message: "expected Authorization arguments".to_owned(),
            })?;
        Ok(AuthorizationHeader {
            value: credentials.header_value()?,
        })
    })
}

/// Turns 4xx and 5xx responses into [`Error::HttpStatus`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RaiseError;

impl Middleware for RaiseError {
    fn on_complete(&self, env: &mut Env) -> crate::Result<()> {
        let Some(status) = env.status() else {
            return Ok(());
        };
        if !status.is_client_error() && !status.is_server_error() {
            return Ok(());
        }
        let body = env
            .response()
            .body()
            .map(|body| truncate_body(body))
            .unwrap_or_default();
        Err(Error::HttpStatus {
            status: status.as_u16(),
            method: env.method().clone(),
            uri: redact_url_for_logs(env.url()),
            body,
        })
    }
}

pub fn raise_error_class() -> HandlerClass {
    HandlerClass::hooks("raise_error", |_| Ok(RaiseError))
}

/// Decoded JSON response body, stored in the env extensions by the `json` response middleware.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedJson(pub serde_json::Value);

/// Parses JSON response bodies whose content type mentions `json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonResponse;

impl JsonResponse {
    fn is_json(env: &Env) -> bool {
        env.response()
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|content_type| content_type.to_ascii_lowercase().contains("json"))
    }
}

impl Middleware for JsonResponse {
    fn on_complete(&self, env: &mut Env) -> crate::Result<()> {
        if !Self::is_json(env) {
            return Ok(());
        }
        let Some(body) = env.response().body().filter(|body| !body.trim_ascii().is_empty())
        else {
            return Ok(());
        };
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|source| Error::Deserialize {
                source,
                body: truncate_body(body),
            })?;
        env.extensions_mut().insert(ParsedJson(value));
        Ok(())
    }
}

pub fn json_response_class() -> HandlerClass {
    HandlerClass::hooks("json_response", |_| Ok(JsonResponse))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::CONTENT_TYPE;
    use http::{HeaderMap, Method, StatusCode};
    use url::Url;

    use super::{Authorization, JsonRequest, JsonResponse, ParsedJson, RaiseError, UrlEncoded};
    use crate::body::RequestBody;
    use crate::env::Env;
    use crate::error::ErrorCode;
    use crate::handler::Middleware;

    fn env(method: Method) -> Env {
        Env::new(method, Url::parse("http://api.test/items").expect("url"))
    }

    #[test]
    fn url_encoded_serializes_text_params() {
        let mut env = env(Method::POST).with_body(RequestBody::params([("name", "a b"), ("n", "1")]));
        UrlEncoded.on_request(&mut env).expect("encode");

        assert_eq!(
            env.request_body().as_bytes(),
            Some(&Bytes::from_static(b"name=a+b&n=1"))
        );
        assert_eq!(
            env.request_headers()[CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn json_request_keeps_explicit_content_type() {
        let mut env = env(Method::POST).with_body(serde_json::json!({"id": 7}));
        env.request_headers_mut()
            .insert(CONTENT_TYPE, "application/vnd.api+json".parse().expect("header"));
        JsonRequest.on_request(&mut env).expect("encode");

        assert_eq!(
            env.request_body().as_bytes(),
            Some(&Bytes::from_static(br#"{"id":7}"#))
        );
        assert_eq!(env.request_headers()[CONTENT_TYPE], "application/vnd.api+json");
    }

    #[test]
    fn basic_authorization_is_base64_encoded() {
        let value = Authorization::basic("aladdin", "opensesame")
            .header_value()
            .expect("header");
        assert_eq!(value, "Basic YWxhZGRpbjpvcGVuc2VzYW1l");
        assert!(value.is_sensitive());
    }

    #[test]
    fn raise_error_maps_server_errors() {
        let mut env = env(Method::GET);
        env.save_response(
            StatusCode::BAD_GATEWAY,
            HeaderMap::new(),
            Bytes::from_static(b"upstream down"),
            None,
        )
        .expect("save");

        let error = RaiseError.on_complete(&mut env).expect_err("502");
        assert_eq!(error.code(), ErrorCode::HttpStatus);
        assert!(error.to_string().contains("502"));
    }

    #[test]
    fn json_response_stores_parsed_body() {
        let mut env = env(Method::GET);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/json; charset=utf-8".parse().expect("header"));
        env.save_response(StatusCode::OK, headers, Bytes::from_static(br#"{"ok":true}"#), None)
            .expect("save");

        JsonResponse.on_complete(&mut env).expect("parse");
        assert_eq!(
            env.extensions().get::<ParsedJson>(),
            Some(&ParsedJson(serde_json::json!({"ok": true})))
        );
    }
}
