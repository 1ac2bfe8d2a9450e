//! The core crate of the Transom messaging fabric.
//!
//! Transom makes window-to-window messaging feel like a local HTTP
//! client/server. A [`Client`] addresses Express-style paths on a peer
//! window; a [`Server`] routes them through middleware to handlers that
//! reply with JSON, files, or streams. Underneath, every exchange is a set
//! of JSON frames posted over a `postMessage`-shaped primitive that
//! broadcasts to every listener, delivers best-effort, and may lose its
//! peer mid-exchange; the layers here exist to make that tolerable.
//!
//! The moving parts, bottom-up:
//!
//! - [`conn`] — the in-process window runtime the fabric runs over.
//! - [`proto`] — the wire frame.
//! - [`channel`] — one shared, filtered subscription per window and key.
//! - [`dispatch`] — fan-out of deliveries to per-kind handlers.
//! - [`hub`] — per-endpoint ownership: dispatcher, pending state, policy.
//! - [`stream`] — chunked bodies with credit-based flow and file codecs.
//! - [`client`] / [`server`] — the endpoint surfaces.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod channel;
pub mod client;
pub mod conn;
mod context;
mod depot;
pub mod dispatch;
mod error;
pub mod facade;
mod heartbeat;
pub mod http;
pub mod hub;
mod inbox;
pub mod interceptor;
pub mod outbox;
pub mod proto;
pub mod routing;
pub mod server;
pub mod stream;
#[cfg(feature = "test")]
#[cfg_attr(docsrs, doc(cfg(feature = "test")))]
pub mod test_util;

pub use self::client::{Client, ClientOptions, ClientResponse, SendRequestOptions};
pub use self::conn::{MessageEvent, Window};
pub use self::context::{MessageContext, Stage};
pub use self::depot::Depot;
pub use self::error::{Error, ErrorCode, Failure};
pub use self::http::{
    Blob, File, Headers, IncomingBody, OutgoingBody, ServerRequest, ServerResponse,
};
pub use self::hub::{Hub, HubOptions, OriginMatcher, OriginValidator};
pub use self::outbox::Outbox;
pub use self::proto::{Frame, Role};
pub use self::server::{
    HandlerResult, Middleware, MiddlewareId, RouteHandler, Server, ServerOptions,
};
pub use self::stream::{
    FileContent, FileReadableStream, FileStreamOptions, FileWritableStream, ReadableStream,
    StreamKind, StreamStatus, WritableStream,
};

/// Result type which has [`enum@Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A list of things that automatically imports for fabric applications.
pub mod prelude {
    pub use crate::client::{Client, ClientOptions, ClientResponse};
    pub use crate::conn::Window;
    pub use crate::error::{Error, ErrorCode};
    pub use crate::http::{IncomingBody, OutgoingBody, ServerRequest, ServerResponse};
    pub use crate::server::{HandlerResult, Server, ServerOptions};
    pub use crate::stream::{FileStreamOptions, StreamOptions, WritableStream};
}
