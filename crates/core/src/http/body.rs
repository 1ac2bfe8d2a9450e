//! Bodies and the binary value types that ride inside them.

use std::fmt::{self, Debug, Formatter};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::stream::{FileReadableStream, FileWritableStream, ReadableStream, WritableStream};

/// An immutable byte buffer with a media type, standing in for a browser
/// `Blob`.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    bytes: Bytes,
    mime_type: String,
}

impl Blob {
    /// New blob over `bytes` with the given media type.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The media type.
    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The raw bytes, by value.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Lossy UTF-8 view of the content.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl Debug for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("mime_type", &self.mime_type)
            .field("size", &self.size())
            .finish()
    }
}

/// A named [`Blob`], standing in for a browser `File`.
#[derive(Clone, PartialEq, Eq)]
pub struct File {
    blob: Blob,
    name: String,
}

impl File {
    /// New file with the given name, content and media type.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            blob: Blob::new(bytes, mime_type),
            name: name.into(),
        }
    }

    /// The file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The content as a blob.
    #[must_use]
    pub fn blob(&self) -> &Blob {
        &self.blob
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.blob.size()
    }

    /// The media type.
    #[must_use]
    pub fn mime_type(&self) -> &str {
        self.blob.mime_type()
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.blob.as_bytes()
    }

    /// Lossy UTF-8 view of the content.
    #[must_use]
    pub fn text(&self) -> String {
        self.blob.text()
    }
}

impl Debug for File {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type())
            .field("size", &self.size())
            .finish()
    }
}

/// What a caller hands to `send`: the runtime type decides the wire path.
///
/// Plain values travel inline on the frame, files and blobs are adapted to a
/// file stream, and a prepared writable stream is started as-is.
#[derive(Debug)]
pub enum OutgoingBody {
    /// No body.
    Empty,
    /// Inline JSON payload.
    Json(Value),
    /// A file, sent as an auto-resolving file stream.
    File(File),
    /// A blob, sent as an auto-resolving file stream without a name.
    Blob(Blob),
    /// A caller-built data stream.
    Stream(WritableStream),
    /// A caller-built file stream.
    FileStream(FileWritableStream),
}

impl OutgoingBody {
    /// `true` when there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl From<Value> for OutgoingBody {
    fn from(value: Value) -> Self {
        if value.is_null() {
            Self::Empty
        } else {
            Self::Json(value)
        }
    }
}
impl From<&str> for OutgoingBody {
    fn from(text: &str) -> Self {
        Self::Json(Value::String(text.to_owned()))
    }
}
impl From<String> for OutgoingBody {
    fn from(text: String) -> Self {
        Self::Json(Value::String(text))
    }
}
impl From<File> for OutgoingBody {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}
impl From<Blob> for OutgoingBody {
    fn from(blob: Blob) -> Self {
        Self::Blob(blob)
    }
}
impl From<WritableStream> for OutgoingBody {
    fn from(stream: WritableStream) -> Self {
        Self::Stream(stream)
    }
}
impl From<FileWritableStream> for OutgoingBody {
    fn from(stream: FileWritableStream) -> Self {
        Self::FileStream(stream)
    }
}
impl From<()> for OutgoingBody {
    fn from((): ()) -> Self {
        Self::Empty
    }
}

/// What a request or response carried, as the receiving side sees it.
#[derive(Debug)]
pub enum IncomingBody {
    /// No body.
    Empty,
    /// Inline JSON payload.
    Json(Value),
    /// A fully materialized file (auto-resolved file stream).
    File(File),
    /// A data stream still in flight.
    Stream(ReadableStream),
    /// A file stream still in flight.
    FileStream(FileReadableStream),
}

impl IncomingBody {
    /// `true` when there is no body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The inline JSON payload, when that is what arrived.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The materialized file, when that is what arrived.
    #[must_use]
    pub fn as_file(&self) -> Option<&File> {
        match self {
            Self::File(file) => Some(file),
            _ => None,
        }
    }

    /// Deserialize the inline JSON payload.
    pub fn parse<T: DeserializeOwned>(&self) -> crate::Result<T> {
        match self {
            Self::Json(value) => Ok(serde_json::from_value(value.clone())?),
            Self::Empty => Ok(serde_json::from_value(Value::Null)?),
            _ => Err(crate::Error::InvalidState(
                "body is a stream or file, not inline JSON".into(),
            )),
        }
    }
}

impl Default for IncomingBody {
    fn default() -> Self {
        Self::Empty
    }
}

/// Content type a plain inline value is labeled with when the sender did
/// not say: strings that look like serialized JSON stay JSON, other strings
/// are plain text, and everything structured is JSON.
#[must_use]
pub fn content_type_for_value(value: &Value) -> &'static str {
    match value {
        Value::String(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                "application/json"
            } else {
                "text/plain; charset=utf-8"
            }
        }
        _ => "application/json",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blob_and_file_basics() {
        let file = File::new("greeting.txt", "Hello World", "text/plain");
        assert_eq!(file.name(), "greeting.txt");
        assert_eq!(file.size(), 11);
        assert_eq!(file.text(), "Hello World");
        assert_eq!(file.mime_type(), "text/plain");
    }

    #[test]
    fn outgoing_body_dispatches_on_type() {
        assert!(matches!(OutgoingBody::from(json!(null)), OutgoingBody::Empty));
        assert!(matches!(
            OutgoingBody::from(json!({"a": 1})),
            OutgoingBody::Json(_)
        ));
        assert!(matches!(
            OutgoingBody::from(File::new("f", "x", "text/plain")),
            OutgoingBody::File(_)
        ));
        assert!(matches!(
            OutgoingBody::from(Blob::new("x", "application/octet-stream")),
            OutgoingBody::Blob(_)
        ));
    }

    #[test]
    fn incoming_body_parse() {
        let body = IncomingBody::Json(json!({"id": 7}));
        #[derive(serde::Deserialize)]
        struct Payload {
            id: u32,
        }
        let payload: Payload = body.parse().expect("parse");
        assert_eq!(payload.id, 7);
    }

    #[test]
    fn content_type_inference() {
        assert_eq!(content_type_for_value(&json!({"a": 1})), "application/json");
        assert_eq!(content_type_for_value(&json!([1, 2])), "application/json");
        assert_eq!(
            content_type_for_value(&json!("{\"inline\": true}")),
            "application/json"
        );
        assert_eq!(
            content_type_for_value(&json!("hello")),
            "text/plain; charset=utf-8"
        );
    }
}
