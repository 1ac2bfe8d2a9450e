//! The requesting endpoint.
//!
//! A [`Client`] is bound to one peer window. `send` drives the full request
//! lifecycle: emit the request, then wait through up to three timeout
//! bands — until a server claims it, until the reply, and (when the
//! handler went asynchronous) a longer grace band — resolving on a reply
//! frame or a reply stream.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::{Duration, timeout};

use crate::conn::Window;
use crate::error::{Error, ErrorCode, Failure};
use crate::facade::{Facade, FacadeOptions, null_to_none};
#[cfg(feature = "cookie")]
use crate::http::CookieStore;
use crate::http::{Headers, IncomingBody, OutgoingBody, status_text};
use crate::hub::{Hub, HubOptions, OriginMatcher, OriginValidator};
use crate::inbox::{InboxEvent, register_pending_request, remove_pending_request};
use crate::interceptor::Interceptors;
use crate::outbox::{Outbox, RequestParts};
use crate::proto::{Frame, Role, random_id};
use crate::stream::{FileContent, FileStreamOptions, FileWritableStream, WritableStream};

/// Construction options for a [`Client`].
pub struct ClientOptions {
    /// Origin the peer window must present; `"*"` disables the check.
    pub target_origin: String,
    /// Channel-isolation tag shared with the peer.
    pub secret_key: Option<String>,
    /// Structural allow-list for reply origins.
    pub allowed_origins: Option<OriginMatcher>,
    /// Full-context reply origin validator; wins over `allowed_origins`.
    pub validate_origin: Option<OriginValidator>,
    /// How long to wait for a server to claim a request.
    pub ack_timeout: Duration,
    /// How long to wait for the reply after the claim.
    pub request_timeout: Duration,
    /// How long to wait once the handler reported asynchronous work.
    pub async_timeout: Duration,
    /// How long a connectivity probe waits.
    pub connect_timeout: Duration,
    /// Explicit endpoint id.
    pub instance_id: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            target_origin: "*".to_owned(),
            secret_key: None,
            allowed_origins: None,
            validate_origin: None,
            ack_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            async_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(3),
            instance_id: None,
        }
    }
}

impl Debug for ClientOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("target_origin", &self.target_origin)
            .field("secret_key", &self.secret_key)
            .field("ack_timeout", &self.ack_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("async_timeout", &self.async_timeout)
            .finish()
    }
}

/// Per-send overrides.
#[derive(Debug, Default)]
pub struct SendRequestOptions {
    /// Extra request headers.
    pub headers: Option<Headers>,
    /// Address one specific server endpoint.
    pub target_id: Option<String>,
    /// Override the claim band.
    pub ack_timeout: Option<Duration>,
    /// Override the reply band.
    pub request_timeout: Option<Duration>,
    /// Override the asynchronous grace band.
    pub async_timeout: Option<Duration>,
}

/// What a send is about to put on the wire; request interceptors see and
/// may rewrite this.
#[derive(Debug)]
pub struct RequestConfig {
    /// Route path, before channel namespacing.
    pub path: String,
    /// Request body.
    pub body: OutgoingBody,
    /// Request headers.
    pub headers: Headers,
    /// Addressed server endpoint.
    pub target_id: Option<String>,
}

/// A resolved reply.
#[derive(Debug)]
pub struct ClientResponse {
    /// HTTP-style status.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Reply headers.
    pub headers: Headers,
    /// Reply payload: inline JSON, a materialized file, or a stream.
    pub data: IncomingBody,
    /// Correlation id of the request.
    pub request_id: String,
}

impl ClientResponse {
    /// Deserialize the inline JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        self.data.parse()
    }
}

struct ClientInner {
    facade: Facade,
    outbox: Outbox,
    peer: Window,
    target_origin: String,
    ack_timeout: Duration,
    request_timeout: Duration,
    async_timeout: Duration,
    connect_timeout: Duration,
    peer_id: Mutex<Option<String>>,
    #[cfg(feature = "cookie")]
    cookies: CookieStore,
    request_interceptors: Interceptors<RequestConfig>,
    response_interceptors: Interceptors<ClientResponse>,
}

/// The requesting endpoint, bound to one peer window.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client that listens on `local` and addresses `peer`.
    /// Call [`open`](Self::open) (or use [`connect`](Self::connect))
    /// before sending.
    #[must_use]
    pub fn new(local: &Window, peer: &Window, options: ClientOptions) -> Self {
        let hub = Hub::new(
            local,
            Role::Client,
            HubOptions {
                secret_key: options.secret_key,
                instance_id: options.instance_id,
                min_version: None,
            },
        );
        hub.set_fallback_target(peer.clone(), options.target_origin.clone());
        let facade = Facade::new(
            hub.clone(),
            FacadeOptions {
                allowed_origins: options.allowed_origins,
                validate_origin: options.validate_origin,
            },
        );
        facade.install_client_handlers();
        let outbox = hub.create_outbox(peer.clone(), options.target_origin.clone(), None);
        Self {
            inner: Arc::new(ClientInner {
                facade,
                outbox,
                peer: peer.clone(),
                target_origin: options.target_origin,
                ack_timeout: options.ack_timeout,
                request_timeout: options.request_timeout,
                async_timeout: options.async_timeout,
                connect_timeout: options.connect_timeout,
                peer_id: Mutex::new(None),
                #[cfg(feature = "cookie")]
                cookies: CookieStore::new(),
                request_interceptors: Interceptors::new(),
                response_interceptors: Interceptors::new(),
            }),
        }
    }

    /// Build and open in one step.
    #[must_use]
    pub fn connect(local: &Window, peer: &Window, options: ClientOptions) -> Self {
        let client = Self::new(local, peer, options);
        client.open();
        client
    }

    /// This endpoint's id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.hub().instance_id()
    }

    /// Install the handler set. Idempotent.
    pub fn open(&self) {
        self.hub().open();
    }

    /// Remove the handler set; in-flight sends may still resolve.
    pub fn close(&self) {
        self.hub().close();
    }

    /// Tear the endpoint down: pending sends are dropped, timers cleared,
    /// the shared channel reference released.
    pub fn destroy(&self) {
        self.hub().destroy();
    }

    /// Whether the handler set is installed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.hub().is_open()
    }

    /// Whether the peer window can still receive.
    #[must_use]
    pub fn is_available(&self) -> bool {
        Window::is_available(&self.inner.peer)
    }

    /// Request interceptor chain.
    #[must_use]
    pub fn request_interceptors(&self) -> &Interceptors<RequestConfig> {
        &self.inner.request_interceptors
    }

    /// Response interceptor chain.
    #[must_use]
    pub fn response_interceptors(&self) -> &Interceptors<ClientResponse> {
        &self.inner.response_interceptors
    }

    /// The cookie jar attached to this client.
    #[cfg(feature = "cookie")]
    #[must_use]
    pub fn cookies(&self) -> &CookieStore {
        &self.inner.cookies
    }

    /// Peer endpoint id learned from the last successful probe.
    #[must_use]
    pub fn peer_id(&self) -> Option<String> {
        self.inner.peer_id.lock().clone()
    }

    /// Send a request and wait for its reply.
    pub async fn send(
        &self,
        path: &str,
        body: impl Into<OutgoingBody>,
    ) -> crate::Result<ClientResponse> {
        self.send_with(path, body, SendRequestOptions::default())
            .await
    }

    /// Send a request with per-call overrides.
    pub async fn send_with(
        &self,
        path: &str,
        body: impl Into<OutgoingBody>,
        options: SendRequestOptions,
    ) -> crate::Result<ClientResponse> {
        let result = self.send_inner(path, body.into(), options).await;
        self.inner.response_interceptors.run(result)
    }

    /// Send `content` as the streamed request body.
    pub async fn send_file(
        &self,
        path: &str,
        content: impl Into<FileContent>,
        options: FileStreamOptions,
    ) -> crate::Result<ClientResponse> {
        let stream = FileWritableStream::new(content, options);
        self.send(path, OutgoingBody::FileStream(stream)).await
    }

    /// Send a prepared stream as the request body.
    pub async fn send_stream(
        &self,
        path: &str,
        stream: WritableStream,
    ) -> crate::Result<ClientResponse> {
        self.send(path, OutgoingBody::Stream(stream)).await
    }

    /// Probe the peer window. `true` as soon as any endpoint over there
    /// claims the probe or answers it; `false` on timeout.
    pub async fn is_connect(&self) -> bool {
        let peer_id: Box<dyn FnOnce(String) + Send> = {
            let inner = Arc::clone(&self.inner);
            Box::new(move |id: String| {
                *inner.peer_id.lock() = Some(id);
            })
        };
        self.inner
            .facade
            .ping_is_connect(
                &self.inner.peer,
                &self.inner.target_origin,
                self.inner.connect_timeout,
                Some(peer_id),
            )
            .await
    }

    fn hub(&self) -> &Hub {
        self.inner.facade.hub()
    }

    async fn send_inner(
        &self,
        path: &str,
        body: OutgoingBody,
        options: SendRequestOptions,
    ) -> crate::Result<ClientResponse> {
        if !self.is_open() {
            return Err(Error::coded(
                ErrorCode::IframeNotReady,
                "endpoint is not open",
            ));
        }
        if !self.is_available() {
            return Err(Error::coded(
                ErrorCode::TargetWindowClosed,
                "peer window is closed",
            ));
        }

        let config = self.inner.request_interceptors.run(Ok(RequestConfig {
            path: path.to_owned(),
            body,
            headers: options.headers.unwrap_or_default(),
            target_id: options.target_id.or_else(|| self.peer_id()),
        }))?;

        let hub = self.hub().clone();
        let request_id = format!("req-{}", random_id(12));
        let display_path = config.path.clone();
        let wire_path = hub.channel().prefix_path(&config.path);

        #[cfg(feature = "cookie")]
        let cookies = {
            let map = self.inner.cookies.cookies_for(&config.path);
            (!map.is_empty()).then(|| Value::Object(map))
        };
        #[cfg(not(feature = "cookie"))]
        let cookies: Option<Value> = None;

        let expected_origin =
            (self.inner.target_origin != "*").then(|| self.inner.target_origin.clone());
        let mut events = register_pending_request(
            &hub,
            &request_id,
            expected_origin,
            self.inner.facade.origin_validator().cloned(),
        );

        let sent = self.inner.outbox.send_request(
            RequestParts {
                request_id: request_id.clone(),
                path: wire_path,
                body: config.body,
                headers: (!config.headers.is_empty()).then(|| config.headers.to_value()),
                cookies,
                ack: None,
                target_id: config.target_id,
            },
            self.inner.facade.streams(),
        );
        if !sent {
            remove_pending_request(&hub, &request_id);
            return Err(Error::failed(
                Failure::new(ErrorCode::TargetWindowClosed, "request could not be delivered")
                    .request_id(request_id.clone())
                    .path(display_path.clone()),
            ));
        }

        let mut band = options.ack_timeout.unwrap_or(self.inner.ack_timeout);
        let mut band_code = ErrorCode::AckTimeout;
        loop {
            let event = match timeout(band, events.recv()).await {
                Err(_) => {
                    remove_pending_request(&hub, &request_id);
                    return Err(Error::failed(
                        Failure::new(band_code, band_timeout_message(band_code))
                            .request_id(request_id.clone())
                            .path(display_path.clone()),
                    ));
                }
                Ok(None) => {
                    return Err(Error::coded(
                        ErrorCode::IframeNotReady,
                        "endpoint destroyed while waiting for a reply",
                    ));
                }
                Ok(Some(event)) => event,
            };
            match event {
                InboxEvent::Ack => {
                    band = options.request_timeout.unwrap_or(self.inner.request_timeout);
                    band_code = ErrorCode::Timeout;
                }
                InboxEvent::Async => {
                    band = options.async_timeout.unwrap_or(self.inner.async_timeout);
                    band_code = ErrorCode::AsyncTimeout;
                }
                InboxEvent::Pong => {}
                InboxEvent::ProtocolError(message) => {
                    remove_pending_request(&hub, &request_id);
                    return Err(Error::failed(
                        Failure::new(ErrorCode::ProtocolUnsupported, message)
                            .request_id(request_id.clone())
                            .path(display_path.clone()),
                    ));
                }
                InboxEvent::Response(frame) => {
                    return Ok(self.build_response(*frame));
                }
                InboxEvent::ErrorFrame(frame) => {
                    return Err(build_error(&frame, &display_path));
                }
                InboxEvent::StreamStart { frame, start, body } => {
                    let data = Facade::resolve_incoming_body(&start, body).await?;
                    remove_pending_request(&hub, &request_id);
                    let headers = frame
                        .headers
                        .as_ref()
                        .map(Headers::from_value)
                        .unwrap_or_default();
                    #[cfg(feature = "cookie")]
                    self.ingest_cookies(&headers);
                    let status = frame.status.unwrap_or(200);
                    return Ok(ClientResponse {
                        status,
                        status_text: frame
                            .status_text
                            .clone()
                            .unwrap_or_else(|| status_text(status).to_owned()),
                        headers,
                        data,
                        request_id: frame.request_id.clone(),
                    });
                }
            }
        }
    }

    fn build_response(&self, frame: Frame) -> ClientResponse {
        let headers = frame
            .headers
            .as_ref()
            .map(Headers::from_value)
            .unwrap_or_default();
        #[cfg(feature = "cookie")]
        self.ingest_cookies(&headers);
        let status = frame.status.unwrap_or(200);
        let data = match null_to_none(frame.data) {
            Some(value) => IncomingBody::Json(value),
            None => IncomingBody::Empty,
        };
        ClientResponse {
            status,
            status_text: frame
                .status_text
                .unwrap_or_else(|| status_text(status).to_owned()),
            headers,
            data,
            request_id: frame.request_id,
        }
    }

    #[cfg(feature = "cookie")]
    fn ingest_cookies(&self, headers: &Headers) {
        let lines = headers.set_cookie_lines();
        if !lines.is_empty() {
            self.inner
                .cookies
                .ingest_set_cookie(lines.iter().map(String::as_str));
        }
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("peer", &self.inner.peer.id())
            .field("target_origin", &self.inner.target_origin)
            .finish()
    }
}

fn band_timeout_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::AckTimeout => "no endpoint claimed the request in time",
        ErrorCode::AsyncTimeout => "asynchronous handler did not finish in time",
        _ => "request timed out waiting for a reply",
    }
}

fn build_error(frame: &Frame, path: &str) -> Error {
    let payload = frame.error.clone().unwrap_or_default();
    let inner_code = payload.code.as_deref().unwrap_or("REQUEST_ERROR");
    let code = match ErrorCode::from_tag(inner_code) {
        Some(ErrorCode::MethodNotFound) => ErrorCode::MethodNotFound,
        _ => ErrorCode::RequestError,
    };
    let status = frame.status.unwrap_or(500);
    let message = match &payload.message {
        Some(message) => format!("{inner_code}: {message}"),
        None => format!("{inner_code}: request failed"),
    };
    Error::failed(
        Failure::new(code, message)
            .status(
                status,
                frame
                    .status_text
                    .clone()
                    .unwrap_or_else(|| status_text(status).to_owned()),
            )
            .request_id(frame.request_id.clone())
            .path(path.to_owned())
            .data(serde_json::json!({
                "code": payload.code,
                "message": payload.message,
            })),
    )
}
