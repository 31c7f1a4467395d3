use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::util::truncate_body;

/// Response half of an [`Env`](crate::Env). Every field stays unset until an adapter saves it.
#[derive(Clone, Debug, Default)]
pub struct Response {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<Bytes>,
    reason_phrase: Option<String>,
    finished: bool,
}

impl Response {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        reason_phrase: Option<String>,
    ) -> Self {
        Self {
            status: Some(status),
            headers,
            body: Some(body),
            reason_phrase,
            finished: false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        self.reason_phrase.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_success(&self) -> bool {
        self.finished && self.status.is_some_and(|status| status.is_success())
    }

    pub fn text_lossy(&self) -> String {
        self.body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
            .unwrap_or_default()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let body = self.body.as_deref().unwrap_or_default();
        serde_json::from_slice(body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(body),
        })
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }
}
