//! The request object handed to middleware and route handlers.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::body::IncomingBody;
use super::headers::Headers;
use crate::depot::Depot;
use crate::routing::PathParams;

struct RequestInner {
    request_id: String,
    path: String,
    origin: String,
    creator_id: Option<String>,
    params: PathParams,
    headers: Headers,
    cookies: HashMap<String, String>,
    body: Mutex<IncomingBody>,
    depot: Mutex<Depot>,
}

/// One inbound request.
///
/// The handle is shared: middleware and the final handler see the same
/// request, so anything parked in the [`Depot`] travels down the chain.
#[derive(Clone)]
pub struct ServerRequest {
    inner: Arc<RequestInner>,
}

impl ServerRequest {
    /// Assemble a request from frame data. Called by the dispatch layer.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request_id: String,
        path: String,
        origin: String,
        creator_id: Option<String>,
        params: PathParams,
        headers: Headers,
        cookies: HashMap<String, String>,
        body: IncomingBody,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                request_id,
                path,
                origin,
                creator_id,
                params,
                headers,
                cookies,
                body: Mutex::new(body),
                depot: Mutex::new(Depot::new()),
            }),
        }
    }

    /// Correlation id of this request.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// The addressed path, as sent.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Origin of the requesting window.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Endpoint id of the requester.
    #[must_use]
    pub fn creator_id(&self) -> Option<&str> {
        self.inner.creator_id.as_deref()
    }

    /// All route captures.
    #[must_use]
    pub fn params(&self) -> &PathParams {
        &self.inner.params
    }

    /// One route capture.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.inner.params.get(name).map(String::as_str)
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// One header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name)
    }

    /// All request cookies.
    #[must_use]
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.inner.cookies
    }

    /// One request cookie.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.inner.cookies.get(name).map(String::as_str)
    }

    /// Deserialize the inline JSON body.
    pub fn parse_body<T: DeserializeOwned>(&self) -> crate::Result<T> {
        self.inner.body.lock().parse()
    }

    /// Clone of the inline JSON body, when that is what arrived.
    #[must_use]
    pub fn body_json(&self) -> Option<Value> {
        self.inner.body.lock().as_json().cloned()
    }

    /// Take the body out, leaving [`IncomingBody::Empty`] behind. Streams
    /// must be taken, not cloned.
    #[must_use]
    pub fn take_body(&self) -> IncomingBody {
        std::mem::take(&mut *self.inner.body.lock())
    }

    /// Run `f` against the per-request [`Depot`].
    pub fn with_depot<R>(&self, f: impl FnOnce(&mut Depot) -> R) -> R {
        f(&mut self.inner.depot.lock())
    }
}

impl Debug for ServerRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRequest")
            .field("request_id", &self.inner.request_id)
            .field("path", &self.inner.path)
            .field("origin", &self.inner.origin)
            .field("params", &self.inner.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: IncomingBody) -> ServerRequest {
        ServerRequest::new(
            "r1".into(),
            "/users/42".into(),
            "https://parent.test".into(),
            Some("c1".into()),
            PathParams::from([("id".to_owned(), "42".to_owned())]),
            Headers::new(),
            HashMap::from([("sid".to_owned(), "s1".to_owned())]),
            body,
        )
    }

    #[test]
    fn accessors() {
        let req = request(IncomingBody::Json(json!({"name": "a"})));
        assert_eq!(req.param("id"), Some("42"));
        assert_eq!(req.cookie("sid"), Some("s1"));
        assert_eq!(req.body_json(), Some(json!({"name": "a"})));
    }

    #[test]
    fn depot_travels_between_clones() {
        let req = request(IncomingBody::Empty);
        let seen_by_middleware = req.clone();
        seen_by_middleware.with_depot(|depot| {
            depot.insert("user", "alex".to_owned());
        });
        let user = req.with_depot(|depot| depot.get::<String>("user").cloned());
        assert_eq!(user.as_deref(), Some("alex"));
    }

    #[test]
    fn take_body_leaves_empty() {
        let req = request(IncomingBody::Json(json!(1)));
        assert!(matches!(req.take_body(), IncomingBody::Json(_)));
        assert!(matches!(req.take_body(), IncomingBody::Empty));
    }
}
