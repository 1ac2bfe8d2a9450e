//! The answering endpoint.
//!
//! Requests are routed by path, claimed against co-resident endpoints,
//! acknowledged, run through the matching middleware chain, and answered
//! through the reply builder. Handlers that finish on their first poll
//! answer synchronously; anything slower gets an `async` notice first so
//! the requester switches to its longer timeout band.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures_util::future::{BoxFuture, poll_immediate};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Duration;

use crate::context::MessageContext;
use crate::conn::Window;
use crate::error::ErrorCode;
use crate::facade::{Facade, FacadeOptions, null_to_none};
use crate::http::{Headers, IncomingBody, ServerRequest, ServerResponse, status_text};
use crate::hub::{Hub, HubOptions, OriginMatcher, OriginValidator};
use crate::outbox::Outbox;
use crate::proto::{Frame, Role, kind};
use crate::routing::{PathParams, PathSet, RouteId, RouteTable};

/// What a route handler produces: a value to send when the reply builder
/// was not used directly, or nothing.
pub type HandlerResult = crate::Result<Option<Value>>;

/// A route endpoint.
///
/// Implemented for any `Fn(ServerRequest, ServerResponse) -> Future` with
/// the right output, so plain async closures register directly.
pub trait RouteHandler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, req: ServerRequest, res: ServerResponse) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> RouteHandler for F
where
    F: Fn(ServerRequest, ServerResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, req: ServerRequest, res: ServerResponse) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(req, res))
    }
}

/// A middleware stage. Runs before the route handler; sending a reply (or
/// failing) stops the chain.
pub trait Middleware: Send + Sync + 'static {
    /// Process one request.
    fn call(&self, req: ServerRequest, res: ServerResponse) -> BoxFuture<'static, crate::Result<()>>;
}

impl<F, Fut> Middleware for F
where
    F: Fn(ServerRequest, ServerResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    fn call(&self, req: ServerRequest, res: ServerResponse) -> BoxFuture<'static, crate::Result<()>> {
        Box::pin(self(req, res))
    }
}

/// Token for removing a middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareId(u64);

/// Construction options for a [`Server`].
pub struct ServerOptions {
    /// Channel-isolation tag shared with clients.
    pub secret_key: Option<String>,
    /// Structural allow-list for requester origins.
    pub allowed_origins: Option<OriginMatcher>,
    /// Full-context requester origin validator; wins over `allowed_origins`.
    pub validate_origin: Option<OriginValidator>,
    /// How long a request waits for its announced body stream.
    pub stream_start_timeout: Duration,
    /// Cap on concurrently parked body-stream requests.
    pub max_pending_body_streams: usize,
    /// Explicit endpoint id.
    pub instance_id: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            secret_key: None,
            allowed_origins: None,
            validate_origin: None,
            stream_start_timeout: crate::facade::DEFAULT_STREAM_START_TIMEOUT,
            max_pending_body_streams: 64,
            instance_id: None,
        }
    }
}

impl Debug for ServerOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("secret_key", &self.secret_key)
            .field("allowed_origins", &self.allowed_origins)
            .field("stream_start_timeout", &self.stream_start_timeout)
            .finish()
    }
}

struct MiddlewareEntry {
    id: u64,
    scope: Option<PathSet>,
    handler: Arc<dyn Middleware>,
}

struct ServerInner {
    facade: Facade,
    routes: Mutex<RouteTable<Arc<dyn RouteHandler>>>,
    middlewares: Mutex<Vec<MiddlewareEntry>>,
    next_middleware: Mutex<u64>,
    stream_start_timeout: Duration,
    max_pending_body_streams: usize,
}

const BODY_STREAM_BUCKET: &str = "server:body_streams";

/// The answering endpoint, bound to the window it lives in.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Build a server listening on `window`. Call [`open`](Self::open)
    /// (or use [`bind`](Self::bind)) to start answering.
    #[must_use]
    pub fn new(window: &Window, options: ServerOptions) -> Self {
        let hub = Hub::new(
            window,
            Role::Server,
            HubOptions {
                secret_key: options.secret_key,
                instance_id: options.instance_id,
                min_version: None,
            },
        );
        let facade = Facade::new(
            hub.clone(),
            FacadeOptions {
                allowed_origins: options.allowed_origins,
                validate_origin: options.validate_origin,
            },
        );
        facade.install_server_base_handlers();

        let server = Self {
            inner: Arc::new(ServerInner {
                facade,
                routes: Mutex::new(RouteTable::new()),
                middlewares: Mutex::new(Vec::new()),
                next_middleware: Mutex::new(1),
                stream_start_timeout: options.stream_start_timeout,
                max_pending_body_streams: options.max_pending_body_streams,
            }),
        };
        let request_server = server.clone();
        hub.on_open(move |hub| {
            let handler_server = request_server.clone();
            let warn_hub = hub.clone();
            let on_version_error: crate::dispatch::VersionErrorHook =
                Arc::new(move |frame: &Frame, _: &MessageContext, version| {
                    warn_hub.warn_once("unsupported-peer-version", || {
                        tracing::warn!(version, request_id = %frame.request_id,
                            "dropping request from peer with unsupported protocol version");
                    });
                });
            let handler_options = hub.create_handler_options(Some(on_version_error));
            hub.register_handler(
                kind::REQUEST,
                Arc::new(move |frame, context| {
                    handler_server.handle_request(frame, context);
                    Ok(())
                }),
                handler_options,
            );
        });
        server
    }

    /// Build and open in one step.
    #[must_use]
    pub fn bind(window: &Window, options: ServerOptions) -> Self {
        let server = Self::new(window, options);
        server.open();
        server
    }

    /// This endpoint's id; clients may address it as `target_id`.
    #[must_use]
    pub fn id(&self) -> &str {
        self.hub().instance_id()
    }

    /// Install the handler set. Idempotent.
    pub fn open(&self) {
        self.hub().open();
    }

    /// Remove the handler set. Idempotent.
    pub fn close(&self) {
        self.hub().close();
    }

    /// Tear the endpoint down.
    pub fn destroy(&self) {
        self.hub().destroy();
    }

    /// Whether the handler set is installed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.hub().is_open()
    }

    /// Register a handler under one or more route patterns. The returned
    /// token unregisters it via [`off`](Self::off).
    pub fn on(&self, paths: impl Into<PathSet>, handler: impl RouteHandler) -> RouteId {
        self.inner.routes.lock().add(paths, Arc::new(handler))
    }

    /// Remove one route registration.
    pub fn off(&self, id: RouteId) {
        self.inner.routes.lock().remove(id);
    }

    /// Remove every registration for the literal `path`.
    pub fn off_path(&self, path: &str) {
        self.inner.routes.lock().remove_path(path);
    }

    /// Register many routes at once; the returned tokens unregister them.
    pub fn mount(
        &self,
        routes: impl IntoIterator<Item = (&'static str, Arc<dyn RouteHandler>)>,
    ) -> Vec<RouteId> {
        let mut table = self.inner.routes.lock();
        routes
            .into_iter()
            .map(|(path, handler)| table.add(path, handler))
            .collect()
    }

    /// Add a middleware that runs for every request.
    pub fn hoop(&self, middleware: impl Middleware) -> MiddlewareId {
        self.add_middleware(None, Arc::new(middleware))
    }

    /// Add a middleware scoped to a boundary path prefix.
    pub fn hoop_at(&self, scope: impl Into<PathSet>, middleware: impl Middleware) -> MiddlewareId {
        self.add_middleware(Some(scope.into()), Arc::new(middleware))
    }

    /// Remove a middleware.
    pub fn unhoop(&self, id: MiddlewareId) {
        self.inner
            .middlewares
            .lock()
            .retain(|entry| entry.id != id.0);
    }

    /// Probe a client window; only a `pong` from `target_origin` counts.
    pub async fn ping_peer(
        &self,
        target: &Window,
        target_origin: &str,
        timeout: Duration,
        target_id: Option<String>,
    ) -> bool {
        self.inner
            .facade
            .ping_peer(target, target_origin, timeout, target_id)
            .await
    }

    fn hub(&self) -> &Hub {
        self.inner.facade.hub()
    }

    fn add_middleware(
        &self,
        scope: Option<PathSet>,
        handler: Arc<dyn Middleware>,
    ) -> MiddlewareId {
        let mut next = self.inner.next_middleware.lock();
        let id = *next;
        *next += 1;
        self.inner.middlewares.lock().push(MiddlewareEntry {
            id,
            scope,
            handler,
        });
        MiddlewareId(id)
    }

    /// Entry point for `request` frames, inside the delivery turn.
    fn handle_request(&self, frame: &Frame, context: &MessageContext) {
        let hub = self.hub();

        // Not addressable: no path, no way to reply, or aimed elsewhere.
        let Some(wire_path) = frame.path.clone() else { return };
        let Some(source) = context.source().cloned() else {
            return;
        };
        if let Some(target_id) = &frame.target_id {
            if target_id != hub.instance_id() {
                return;
            }
        }
        // A co-resident endpoint got there first.
        if context.handled_by().is_some() {
            return;
        }
        // Requester origin policy.
        if let Some(validator) = self.inner.facade.origin_validator() {
            if !hub.is_origin_allowed_by(context.origin(), frame, context, None, Some(validator)) {
                tracing::debug!(origin = %context.origin(), request_id = %frame.request_id,
                    "request origin rejected");
                return;
            }
        }
        // Strip the channel namespace; a path outside it is not ours.
        let path = match hub.channel().secret_key() {
            Some(key) => {
                let Some(stripped) = wire_path.strip_prefix(&format!("{key}:")) else {
                    return;
                };
                stripped.to_owned()
            }
            None => wire_path,
        };

        let outbox = hub.create_outbox(
            source,
            context.origin().to_owned(),
            frame.creator_id.clone(),
        );

        let resolved = {
            let routes = self.inner.routes.lock();
            routes
                .resolve(&path)
                .map(|(handler, params)| (Arc::clone(handler), params))
        };
        let Some((handler, params)) = resolved else {
            // Claim even without a route so exactly one endpoint answers
            // with the routing failure.
            context.mark_handled_by(hub.instance_id());
            outbox.send_error(
                &frame.request_id,
                404,
                status_text(404),
                ErrorCode::MethodNotFound.as_str(),
                &format!("no handler for path {path}"),
            );
            return;
        };

        context.mark_handled_by(hub.instance_id());
        outbox.send_ack(&frame.request_id);

        let res = ServerResponse::new(
            frame.request_id.clone(),
            outbox.clone(),
            self.inner.facade.clone(),
        );

        if let Some(stream_id) = &frame.stream_id {
            self.defer_for_body_stream(frame, context, path, params, handler, outbox, res, stream_id);
        } else {
            let body = match null_to_none(frame.body.clone()) {
                Some(value) => IncomingBody::Json(value),
                None => IncomingBody::Empty,
            };
            let req = build_request(frame, context, path, params, body);
            let server = self.clone();
            tokio::spawn(async move {
                server.run_chain(req, res, handler, outbox).await;
            });
        }
    }

    /// Park a request whose body arrives as a stream until the handshake
    /// lands, then run it.
    #[allow(clippy::too_many_arguments)]
    fn defer_for_body_stream(
        &self,
        frame: &Frame,
        context: &MessageContext,
        path: String,
        params: PathParams,
        handler: Arc<dyn RouteHandler>,
        outbox: Outbox,
        res: ServerResponse,
        stream_id: &str,
    ) {
        let hub = self.hub();
        if !hub.limiter().try_acquire(
            BODY_STREAM_BUCKET,
            "all",
            self.inner.max_pending_body_streams,
        ) {
            outbox.send_error(
                &frame.request_id,
                429,
                status_text(429),
                ErrorCode::RequestError.as_str(),
                "too many requests with pending body streams",
            );
            return;
        }
        tracing::debug!(request_id = %frame.request_id, stream_id,
            "request body arrives as a stream, deferring handler");

        let server = self.clone();
        let frame_snapshot = frame.clone();
        let context_snapshot = context.clone();
        let request_id = frame.request_id.clone();
        self.inner.facade.register_incoming_stream_start_waiter(
            &request_id,
            self.inner.stream_start_timeout,
            move |body| {
                server
                    .hub()
                    .limiter()
                    .release(BODY_STREAM_BUCKET, "all");
                match body {
                    Err(error) => {
                        outbox.send_error(
                            &frame_snapshot.request_id,
                            408,
                            status_text(408),
                            ErrorCode::Timeout.as_str(),
                            &error.to_string(),
                        );
                    }
                    Ok(body) => {
                        let req =
                            build_request(&frame_snapshot, &context_snapshot, path, params, body);
                        let inner_server = server.clone();
                        tokio::spawn(async move {
                            inner_server.run_chain(req, res, handler, outbox).await;
                        });
                    }
                }
            },
        );
    }

    /// Middleware chain, then the handler, then result adaptation.
    async fn run_chain(
        &self,
        req: ServerRequest,
        res: ServerResponse,
        handler: Arc<dyn RouteHandler>,
        outbox: Outbox,
    ) {
        let middlewares: Vec<Arc<dyn Middleware>> = self
            .inner
            .middlewares
            .lock()
            .iter()
            .filter(|entry| match &entry.scope {
                None => true,
                Some(scope) => scope.matches_prefix(req.path()).is_some(),
            })
            .map(|entry| Arc::clone(&entry.handler))
            .collect();

        for middleware in middlewares {
            if res.is_sent() {
                return;
            }
            if let Err(error) = middleware.call(req.clone(), res.clone()).await {
                tracing::error!(%error, request_id = %req.request_id(),
                    "middleware failed");
                if !res.is_sent() {
                    let _ = res
                        .status(500)
                        .send(serde_json::json!({"error": error.to_string()}))
                        .await;
                }
                return;
            }
        }
        if res.is_sent() {
            return;
        }

        // A handler that finishes on its first poll answers synchronously;
        // otherwise the requester is told to switch to its longer band.
        let mut invocation = handler.call(req.clone(), res.clone());
        let outcome = match poll_immediate(&mut invocation).await {
            Some(outcome) => outcome,
            None => {
                outbox.send_async(req.request_id());
                invocation.await
            }
        };

        match outcome {
            Ok(Some(value)) => {
                if !res.is_sent() {
                    if let Err(error) = res.send(value).await {
                        tracing::error!(%error, request_id = %req.request_id(),
                            "failed to send handler return value");
                    }
                }
            }
            Ok(None) => {
                if !res.is_sent() {
                    outbox.send_error(
                        req.request_id(),
                        500,
                        status_text(500),
                        ErrorCode::NoResponse.as_str(),
                        "handler finished without producing a response",
                    );
                }
            }
            Err(error) => {
                if !res.is_sent() {
                    let status = match res.status_code() {
                        200 => 500,
                        other => other,
                    };
                    let code = error
                        .code()
                        .map_or(ErrorCode::RequestError.as_str(), |c| c.as_str());
                    outbox.send_error(
                        req.request_id(),
                        status,
                        status_text(status),
                        code,
                        &error.to_string(),
                    );
                }
            }
        }
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("routes", &self.inner.routes.lock().len())
            .finish()
    }
}

fn build_request(
    frame: &Frame,
    context: &MessageContext,
    path: String,
    params: PathParams,
    body: IncomingBody,
) -> ServerRequest {
    let headers = frame
        .headers
        .as_ref()
        .map(Headers::from_value)
        .unwrap_or_default();
    let cookies = frame
        .cookies
        .as_ref()
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(name, value)| {
                    value
                        .as_str()
                        .map(|value| (name.clone(), value.to_owned()))
                })
                .collect::<HashMap<_, _>>()
        })
        .unwrap_or_default();
    ServerRequest::new(
        frame.request_id.clone(),
        path,
        context.origin().to_owned(),
        frame.creator_id.clone(),
        params,
        headers,
        cookies,
        body,
    )
}
