//! HTTP-shaped request/response data objects.
//!
//! Nothing here touches a real HTTP stack; these are the handler-facing
//! shapes (paths, params, headers, cookies, status codes, bodies) that ride
//! on fabric frames.

mod body;
#[cfg(feature = "cookie")]
mod cookie_store;
mod headers;
mod request;
mod response;

pub use body::{Blob, File, IncomingBody, OutgoingBody, content_type_for_value};
#[cfg(feature = "cookie")]
pub use cookie_store::CookieStore;
pub use headers::Headers;
pub use request::ServerRequest;
pub use response::{SendOptions, ServerResponse};

/// Canonical reason phrase for the status codes this fabric emits.
#[must_use]
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
