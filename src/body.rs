use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::Error;
use crate::util::lock_unpoisoned;

/// A readable, rewindable upload source.
pub trait ReadSeek: Read + Seek + Send {}

impl<T> ReadSeek for T where T: Read + Seek + Send {}

/// A shared file-like upload part.
///
/// Clones share the underlying reader, so a body snapshot taken before dispatch and the body an
/// adapter consumes point at the same cursor. [`UploadIo::rewind`] resets that cursor.
#[derive(Clone)]
pub struct UploadIo {
    reader: Arc<Mutex<Box<dyn ReadSeek>>>,
    content_type: String,
    filename: Option<String>,
}

impl std::fmt::Debug for UploadIo {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("UploadIo")
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .finish()
    }
}

impl UploadIo {
    pub fn new(reader: impl ReadSeek + 'static, content_type: impl Into<String>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Box::new(reader))),
            content_type: content_type.into(),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn rewind(&self) -> std::io::Result<()> {
        let mut reader = lock_unpoisoned(&self.reader);
        reader.seek(SeekFrom::Start(0)).map(|_| ())
    }

    /// Reads from the current position to the end.
    pub fn read_remaining(&self) -> crate::Result<Bytes> {
        let mut reader = lock_unpoisoned(&self.reader);
        let mut collected = Vec::new();
        reader
            .read_to_end(&mut collected)
            .map_err(|source| Error::ReadBody { source })?;
        Ok(Bytes::from(collected))
    }

    pub fn position(&self) -> std::io::Result<u64> {
        let mut reader = lock_unpoisoned(&self.reader);
        reader.stream_position()
    }
}

#[derive(Clone, Debug)]
pub enum ParamValue {
    Text(String),
    File(UploadIo),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<UploadIo> for ParamValue {
    fn from(value: UploadIo) -> Self {
        Self::File(value)
    }
}

#[derive(Clone, Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Params(Vec<(String, ParamValue)>),
    Json(serde_json::Value),
    Reader(UploadIo),
}

impl RequestBody {
    pub fn params<I, K, V>(params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        Self::Params(
            params
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Params(params) => params.is_empty(),
            Self::Json(_) | Self::Reader(_) => false,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Rewinds every file-like part so a replayed send starts from the beginning.
    pub fn rewind_files(&self) -> std::io::Result<()> {
        match self {
            Self::Reader(upload) => upload.rewind(),
            Self::Params(params) => {
                for (_, value) in params {
                    if let ParamValue::File(upload) = value {
                        upload.rewind()?;
                    }
                }
                Ok(())
            }
            Self::Empty | Self::Bytes(_) | Self::Json(_) => Ok(()),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static str> for RequestBody {
    fn from(value: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}
