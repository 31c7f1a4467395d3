//! Terminal handlers that turn an [`Env`](crate::env::Env) into a response.

#[cfg(feature = "ureq")]
pub mod ureq;

use bytes::Bytes;

use crate::body::{ParamValue, RequestBody};
use crate::env::Env;
use crate::error::Error;

/// Flattens the request body into the bytes an adapter sends.
///
/// Params that still carry file parts cannot be sent without a multipart encoder.
pub(crate) fn request_bytes(env: &Env) -> crate::Result<Bytes> {
    match env.request_body() {
        RequestBody::Empty => Ok(Bytes::new()),
        RequestBody::Bytes(bytes) => Ok(bytes.clone()),
        RequestBody::Json(value) => serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|source| Error::SerializeJson { source }),
        RequestBody::Reader(upload) => upload.read_remaining(),
        RequestBody::Params(params) => {
            let mut pairs = Vec::with_capacity(params.len());
            for (name, value) in params {
                let ParamValue::Text(text) = value else {
                    return Err(Error::InvalidHandler {
                        handler: "adapter".to_owned(),
                        message: format!("param {name} is a file; add a multipart encoder"),
                    });
                };
                pairs.push((name.as_str(), text.as_str()));
            }
            serde_urlencoded::to_string(&pairs)
                .map(Bytes::from)
                .map_err(|source| Error::SerializeForm { source })
        }
    }
}
