//! The reply builder handed to middleware and route handlers.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

#[cfg(feature = "cookie")]
use cookie::Cookie;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Duration;

use super::body::{OutgoingBody, content_type_for_value};
use super::headers::Headers;
use super::status_text;
use crate::facade::{DEFAULT_ACK_WAIT, Facade};
use crate::outbox::{Outbox, ResponseParts};
use crate::proto::AckEcho;
use crate::stream::{FileStreamOptions, ResponseHead, WritableStream};

/// Options for [`ServerResponse::send_with`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Ask the requester to confirm receipt; the send resolves `true` only
    /// when the confirmation arrives in time.
    pub require_ack: bool,
    /// Echo id binding the confirmation; generated when absent.
    pub ack_id: Option<String>,
    /// How long to wait for the confirmation.
    pub ack_wait: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            require_ack: false,
            ack_id: None,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }
}

struct ResponseState {
    status: u16,
    status_text: Option<String>,
    headers: Headers,
    sent: bool,
}

struct ResponseInner {
    request_id: String,
    outbox: Outbox,
    facade: Facade,
    state: Mutex<ResponseState>,
}

/// Builder for the reply to one request.
///
/// Clones share state; the first successful `send` wins and every later
/// attempt reports `false`. The builder stays usable after the handler
/// returns, which is what lets a receipt-confirmed send keep waiting.
#[derive(Clone)]
pub struct ServerResponse {
    inner: Arc<ResponseInner>,
}

impl ServerResponse {
    pub(crate) fn new(request_id: String, outbox: Outbox, facade: Facade) -> Self {
        Self {
            inner: Arc::new(ResponseInner {
                request_id,
                outbox,
                facade,
                state: Mutex::new(ResponseState {
                    status: 200,
                    status_text: None,
                    headers: Headers::new(),
                    sent: false,
                }),
            }),
        }
    }

    /// The request being answered.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// Sets the status code and returns `&Self` for chaining.
    pub fn status(&self, code: u16) -> &Self {
        self.inner.state.lock().status = code;
        self
    }

    /// Current status code.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.inner.state.lock().status
    }

    /// Override the reason phrase.
    pub fn status_message(&self, text: impl Into<String>) -> &Self {
        self.inner.state.lock().status_text = Some(text.into());
        self
    }

    /// Sets a header (case-insensitive; `Set-Cookie` accumulates) and
    /// returns `&Self`.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        self.inner.state.lock().headers.set(name, value);
        self
    }

    /// One header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .headers
            .get(name)
            .map(ToOwned::to_owned)
    }

    /// Snapshot of the headers.
    #[must_use]
    pub fn headers(&self) -> Headers {
        self.inner.state.lock().headers.clone()
    }

    /// Append a `Set-Cookie` line for `cookie`.
    #[cfg(feature = "cookie")]
    pub fn cookie(&self, cookie: Cookie<'_>) -> &Self {
        self.inner
            .state
            .lock()
            .headers
            .append("Set-Cookie", cookie.to_string());
        self
    }

    /// Append the removal cookie that deletes `name` on the peer.
    #[cfg(feature = "cookie")]
    pub fn clear_cookie(&self, name: &str) -> &Self {
        let removal = Cookie::build((name.to_owned(), ""))
            .path("/")
            .max_age(cookie::time::Duration::ZERO)
            .build();
        self.cookie(removal)
    }

    /// Whether a reply already went out.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.inner.state.lock().sent
    }

    /// Send `body` with default options. Reports `false` when something was
    /// already sent.
    pub async fn send(&self, body: impl Into<OutgoingBody>) -> crate::Result<bool> {
        self.send_with(body, SendOptions::default()).await
    }

    /// Send `body`. With `require_ack`, resolves `true` only when the
    /// requester confirmed receipt before the wait expired.
    pub async fn send_with(
        &self,
        body: impl Into<OutgoingBody>,
        options: SendOptions,
    ) -> crate::Result<bool> {
        let body = body.into();
        match body {
            OutgoingBody::Empty => self.send_inline(None, options).await,
            OutgoingBody::Json(value) => self.send_inline(Some(value), options).await,
            OutgoingBody::File(file) => {
                let file_options = FileStreamOptions {
                    file_name: Some(file.name().to_owned()),
                    mime_type: Some(file.mime_type().to_owned()),
                    ..Default::default()
                };
                self.send_file(file, file_options).await
            }
            OutgoingBody::Blob(blob) => {
                let file_options = FileStreamOptions {
                    mime_type: Some(blob.mime_type().to_owned()),
                    ..Default::default()
                };
                self.send_file(blob, file_options).await
            }
            OutgoingBody::Stream(stream) => self.send_stream(stream).await,
            OutgoingBody::FileStream(stream) => {
                if !self.claim_send() {
                    return Ok(false);
                }
                let head = self.make_head();
                self.inner
                    .outbox
                    .send_stream(
                        stream.stream().clone(),
                        &self.inner.request_id,
                        Some(head),
                        self.inner.facade.streams(),
                        false,
                    )
                    .await?;
                Ok(true)
            }
        }
    }

    /// Send a JSON reply.
    pub async fn json(&self, payload: impl Serialize) -> crate::Result<bool> {
        self.set_header("Content-Type", "application/json");
        let value = serde_json::to_value(payload)?;
        self.send_inline_value(value).await
    }

    /// Stream `content` to the requester as a file download.
    pub async fn send_file(
        &self,
        content: impl Into<crate::stream::FileContent>,
        options: FileStreamOptions,
    ) -> crate::Result<bool> {
        if !self.claim_send() {
            return Ok(false);
        }
        let stream = crate::stream::FileWritableStream::new(content, options);
        {
            let mut state = self.inner.state.lock();
            state
                .headers
                .set("Content-Type", stream.mime_type().to_owned());
            if let Some(name) = stream.file_name() {
                state.headers.set(
                    "Content-Disposition",
                    format!("attachment; filename=\"{name}\""),
                );
            }
        }
        let head = self.make_head();
        self.inner
            .outbox
            .send_stream(
                stream.stream().clone(),
                &self.inner.request_id,
                Some(head),
                self.inner.facade.streams(),
                false,
            )
            .await?;
        Ok(true)
    }

    /// Start a prepared stream as the reply body.
    pub async fn send_stream(&self, stream: WritableStream) -> crate::Result<bool> {
        if !self.claim_send() {
            return Ok(false);
        }
        let head = self.make_head();
        self.inner
            .outbox
            .send_stream(
                stream,
                &self.inner.request_id,
                Some(head),
                self.inner.facade.streams(),
                false,
            )
            .await?;
        Ok(true)
    }

    async fn send_inline_value(&self, value: Value) -> crate::Result<bool> {
        self.send_inline(Some(value), SendOptions::default()).await
    }

    async fn send_inline(
        &self,
        data: Option<Value>,
        options: SendOptions,
    ) -> crate::Result<bool> {
        if !self.claim_send() {
            return Ok(false);
        }
        let (status, status_text_value, headers) = {
            let mut state = self.inner.state.lock();
            if let Some(value) = &data {
                if !state.headers.contains("Content-Type") {
                    state.headers.set("Content-Type", content_type_for_value(value));
                }
            }
            (
                state.status,
                state
                    .status_text
                    .clone()
                    .unwrap_or_else(|| status_text(state.status).to_owned()),
                state.headers.to_value(),
            )
        };

        let ack = options.require_ack.then(|| AckEcho {
            id: options.ack_id.clone().unwrap_or_else(|| AckEcho::generate().id),
            meta: None,
        });
        let confirmation = ack
            .as_ref()
            .map(|echo| self.inner.facade.register_pending_ack(&echo.id, options.ack_wait));

        let sent = self.inner.outbox.send_response(ResponseParts {
            request_id: self.inner.request_id.clone(),
            status,
            status_text: status_text_value,
            data,
            headers: Some(headers),
            require_ack: options.require_ack,
            ack,
        });

        match confirmation {
            Some(confirmation) => {
                if !sent {
                    return Ok(false);
                }
                Ok(confirmation.await.unwrap_or(false))
            }
            None => Ok(sent),
        }
    }

    fn claim_send(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.sent {
            return false;
        }
        state.sent = true;
        true
    }

    fn make_head(&self) -> ResponseHead {
        let state = self.inner.state.lock();
        ResponseHead {
            status: state.status,
            status_text: state
                .status_text
                .clone()
                .unwrap_or_else(|| status_text(state.status).to_owned()),
            headers: state.headers.to_value(),
        }
    }
}

impl Debug for ServerResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ServerResponse")
            .field("request_id", &self.inner.request_id)
            .field("status", &state.status)
            .field("sent", &state.sent)
            .finish()
    }
}
