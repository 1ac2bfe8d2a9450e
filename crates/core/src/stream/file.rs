//! File transfer over the stream protocol.
//!
//! The producer splits the raw bytes into spans and base64-codes each span
//! into one `stream_data` chunk; the consumer decodes and reassembles them
//! into one contiguous buffer. Name, media type and size ride in the
//! `stream_start` metadata.

use std::fmt::{self, Debug, Formatter};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};

use super::writable::{DEFAULT_CHUNK_SIZE, StreamOptions, WritableStream};
use super::{ReadableStream, StreamKind, StreamStatus};
use crate::error::Error;
use crate::http::{Blob, File};

/// Anything that can become file-stream content.
#[derive(Debug, Clone)]
pub enum FileContent {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// A blob; its media type is used unless overridden.
    Blob(Blob),
    /// A file; its name and media type are used unless overridden.
    File(File),
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}
impl From<String> for FileContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}
impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}
impl From<Bytes> for FileContent {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}
impl From<Blob> for FileContent {
    fn from(blob: Blob) -> Self {
        Self::Blob(blob)
    }
}
impl From<File> for FileContent {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

/// Options for building a [`FileWritableStream`].
#[derive(Debug, Clone)]
pub struct FileStreamOptions {
    /// File name delivered in metadata; inferred from a [`File`] source.
    pub file_name: Option<String>,
    /// Media type delivered in metadata; inferred from a blob or file.
    pub mime_type: Option<String>,
    /// Whether to split into many chunks.
    pub chunked: bool,
    /// Byte span per chunk before encoding.
    pub chunk_size: usize,
    /// Ask the receiver to materialize a [`File`] before delivery.
    pub auto_resolve: bool,
}

impl Default for FileStreamOptions {
    fn default() -> Self {
        Self {
            file_name: None,
            mime_type: None,
            chunked: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            auto_resolve: true,
        }
    }
}

/// Producer side of a file transfer.
#[derive(Clone)]
pub struct FileWritableStream {
    stream: WritableStream,
    file_name: Option<String>,
    mime_type: String,
    size: usize,
}

impl FileWritableStream {
    /// Build a file stream over `content`.
    #[must_use]
    pub fn new(content: impl Into<FileContent>, options: FileStreamOptions) -> Self {
        let content = content.into();
        let (bytes, inferred_name, inferred_mime) = match content {
            FileContent::Text(text) => (Bytes::from(text), None, Some("text/plain".to_owned())),
            FileContent::Bytes(bytes) => (bytes, None, None),
            FileContent::Blob(blob) => {
                let mime = blob.mime_type().to_owned();
                (blob.into_bytes(), None, Some(mime))
            }
            FileContent::File(file) => {
                let name = file.name().to_owned();
                let mime = file.mime_type().to_owned();
                (file.blob().clone().into_bytes(), Some(name), Some(mime))
            }
        };
        let file_name = options.file_name.clone().or(inferred_name);
        let mime_type = options
            .mime_type
            .clone()
            .or(inferred_mime)
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
        let size = bytes.len();

        let mut metadata = json!({
            "mimeType": mime_type,
            "size": size,
        });
        if let Some(name) = &file_name {
            metadata["filename"] = Value::String(name.clone());
        }

        let chunk_size = options.chunk_size.max(1);
        // A payload that fits one span needs no chunking ceremony.
        let chunked = options.chunked && bytes.len() > chunk_size;
        let chunks = encode_chunks(&bytes, chunk_size, chunked);
        let stream = WritableStream::from_iter(
            chunks,
            StreamOptions {
                kind: StreamKind::File,
                chunked,
                metadata: Some(metadata),
                auto_resolve: options.auto_resolve,
                chunk_ack: false,
            },
        );
        Self {
            stream,
            file_name,
            mime_type,
            size,
        }
    }

    /// The underlying writable stream.
    #[must_use]
    pub fn stream(&self) -> &WritableStream {
        &self.stream
    }

    /// File name that will be announced, if any.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Media type that will be announced.
    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Raw content size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Debug for FileWritableStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWritableStream")
            .field("stream_id", &self.stream.stream_id())
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish()
    }
}

fn encode_chunks(bytes: &[u8], chunk_size: usize, chunked: bool) -> Vec<Value> {
    if bytes.is_empty() {
        return vec![Value::String(String::new())];
    }
    if !chunked {
        return vec![Value::String(BASE64.encode(bytes))];
    }
    bytes
        .chunks(chunk_size)
        .map(|span| Value::String(BASE64.encode(span)))
        .collect()
}

/// Consumer side of a file transfer.
pub struct FileReadableStream {
    stream: ReadableStream,
}

impl FileReadableStream {
    /// Wrap a readable stream that was negotiated as a file stream.
    #[must_use]
    pub fn new(stream: ReadableStream) -> Self {
        Self { stream }
    }

    /// The underlying readable stream.
    #[must_use]
    pub fn stream_mut(&mut self) -> &mut ReadableStream {
        &mut self.stream
    }

    /// Announced file name, when the producer sent one.
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        self.metadata_str("filename")
    }

    /// Announced media type.
    #[must_use]
    pub fn mime_type(&self) -> String {
        self.metadata_str("mimeType")
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string())
    }

    /// Announced raw size, when the producer sent one.
    #[must_use]
    pub fn announced_size(&self) -> Option<u64> {
        self.stream
            .metadata()
            .and_then(|metadata| metadata.get("size"))
            .and_then(Value::as_u64)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.stream.status()
    }

    /// Decode and reassemble the whole payload into one buffer.
    pub async fn read_bytes(&mut self) -> crate::Result<Vec<u8>> {
        let chunks = self.stream.read().await?;
        let mut decoded = Vec::with_capacity(chunks.len());
        let mut total = 0usize;
        for chunk in &chunks {
            let text = chunk.as_str().ok_or_else(|| Error::Stream {
                stream_id: self.stream.stream_id().to_owned(),
                message: "file chunk is not a base64 string".into(),
            })?;
            let bytes = BASE64.decode(text).map_err(|error| Error::Stream {
                stream_id: self.stream.stream_id().to_owned(),
                message: format!("file chunk is not valid base64: {error}"),
            })?;
            total += bytes.len();
            decoded.push(bytes);
        }
        // One contiguous allocation for the merged payload.
        let mut merged = Vec::with_capacity(total);
        for bytes in decoded {
            merged.extend_from_slice(&bytes);
        }
        Ok(merged)
    }

    /// The payload as a [`Blob`].
    pub async fn read_as_blob(&mut self) -> crate::Result<Blob> {
        let mime_type = self.mime_type();
        Ok(Blob::new(self.read_bytes().await?, mime_type))
    }

    /// The payload as a named [`File`].
    pub async fn read_as_file(&mut self) -> crate::Result<File> {
        let name = self.file_name().unwrap_or_else(|| "download".to_owned());
        let mime_type = self.mime_type();
        Ok(File::new(name, self.read_bytes().await?, mime_type))
    }

    /// The payload decoded as UTF-8 text (lossy).
    pub async fn read_as_text(&mut self) -> crate::Result<String> {
        Ok(String::from_utf8_lossy(&self.read_bytes().await?).into_owned())
    }

    /// The payload as a `data:` URL.
    pub async fn read_as_data_url(&mut self) -> crate::Result<String> {
        let mime_type = self.mime_type();
        let bytes = self.read_bytes().await?;
        Ok(format!("data:{mime_type};base64,{}", BASE64.encode(bytes)))
    }

    /// Cancel from the consumer side.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.stream.cancel(reason);
    }

    fn metadata_str(&self, key: &str) -> Option<String> {
        self.stream
            .metadata()
            .and_then(|metadata| metadata.get(key))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }
}

impl Debug for FileReadableStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReadableStream")
            .field("stream_id", &self.stream.stream_id())
            .field("file_name", &self.file_name())
            .field("mime_type", &self.mime_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_encoding_splits_and_round_trips() {
        let payload = b"The quick brown fox jumps over the lazy dog";
        let chunks = encode_chunks(payload, 10, true);
        assert_eq!(chunks.len(), payload.len().div_ceil(10));

        let mut merged = Vec::new();
        for chunk in &chunks {
            merged.extend_from_slice(&BASE64.decode(chunk.as_str().expect("str")).expect("b64"));
        }
        assert_eq!(merged, payload);
    }

    #[test]
    fn single_chunk_when_not_chunked() {
        let chunks = encode_chunks(b"Hello World", 4, false);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], Value::String("SGVsbG8gV29ybGQ=".into()));
    }

    #[test]
    fn writable_infers_name_and_mime_from_file() {
        let file = File::new("notes.md", "# hi", "text/markdown");
        let stream = FileWritableStream::new(file, FileStreamOptions::default());
        assert_eq!(stream.file_name(), Some("notes.md"));
        assert_eq!(stream.mime_type(), "text/markdown");
        assert_eq!(stream.size(), 4);
        assert_eq!(stream.stream().options().kind, StreamKind::File);
    }

    #[test]
    fn explicit_options_override_inference() {
        let stream = FileWritableStream::new(
            "Hello World",
            FileStreamOptions {
                file_name: Some("greeting.txt".into()),
                mime_type: Some("text/plain".into()),
                chunked: false,
                ..Default::default()
            },
        );
        assert_eq!(stream.file_name(), Some("greeting.txt"));
        assert_eq!(stream.mime_type(), "text/plain");
    }
}
