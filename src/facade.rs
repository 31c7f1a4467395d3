//! Process-wide default [`Connection`] with forwarding request functions.
//!
//! Relative paths resolve against `http://localhost/`; pass absolute URLs or install a
//! connection with [`set_default_connection`].

use std::sync::{Arc, LazyLock, RwLock};

use http::{HeaderMap, Method};

use crate::body::RequestBody;
use crate::connection::Connection;
use crate::response::Response;
use crate::util::{read_unpoisoned, write_unpoisoned};

const DEFAULT_URL_PREFIX: &str = "http://localhost/";

static DEFAULT_CONNECTION: LazyLock<RwLock<Option<Arc<Connection>>>> =
    LazyLock::new(|| RwLock::new(None));

/// The shared connection, built from defaults on first use.
pub fn default_connection() -> crate::Result<Arc<Connection>> {
    if let Some(connection) = read_unpoisoned(&DEFAULT_CONNECTION).as_ref() {
        return Ok(Arc::clone(connection));
    }
    let mut slot = write_unpoisoned(&DEFAULT_CONNECTION);
    if let Some(connection) = slot.as_ref() {
        return Ok(Arc::clone(connection));
    }
    let connection = Arc::new(Connection::builder(DEFAULT_URL_PREFIX).try_build()?);
    *slot = Some(Arc::clone(&connection));
    Ok(connection)
}

pub fn set_default_connection(connection: Connection) {
    *write_unpoisoned(&DEFAULT_CONNECTION) = Some(Arc::new(connection));
}

/// Drops the shared connection so the next call rebuilds it.
pub fn reset_default_connection() {
    *write_unpoisoned(&DEFAULT_CONNECTION) = None;
}

pub fn run_request(
    method: Method,
    url: &str,
    body: RequestBody,
    headers: HeaderMap,
) -> crate::Result<Response> {
    default_connection()?.run_request(method, url, body, headers)
}

pub fn get(url: &str) -> crate::Result<Response> {
    default_connection()?.get(url)
}

pub fn head(url: &str) -> crate::Result<Response> {
    default_connection()?.head(url)
}

pub fn delete(url: &str) -> crate::Result<Response> {
    default_connection()?.delete(url)
}

pub fn post(url: &str, body: impl Into<RequestBody>) -> crate::Result<Response> {
    default_connection()?.post(url, body)
}

pub fn put(url: &str, body: impl Into<RequestBody>) -> crate::Result<Response> {
    default_connection()?.put(url, body)
}

pub fn patch(url: &str, body: impl Into<RequestBody>) -> crate::Result<Response> {
    default_connection()?.patch(url, body)
}
