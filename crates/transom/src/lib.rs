//! Transom is an HTTP-shaped request/response fabric over window-style
//! message passing between a document and its frames.
//!
//! A [`Client`] sends to Express-style paths; a [`Server`] answers them
//! through middleware and route handlers, with JSON, file, and streaming
//! bodies. See [`transom_core`] for the full engine documentation.
//!
//! ```no_run
//! use transom::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> transom::Result<()> {
//!     let parent = Window::new("https://app.test");
//!     let frame = Window::new("https://widget.test");
//!
//!     let server = Server::bind(&frame, ServerOptions::default());
//!     server.on("/greet/:name", |req: ServerRequest, _res: ServerResponse| async move {
//!         let name = req.param("name").unwrap_or("world").to_owned();
//!         Ok(Some(serde_json::json!({ "greeting": format!("hello {name}") })))
//!     });
//!
//!     let client = Client::connect(&parent, &frame, ClientOptions::default());
//!     let reply = client.send("/greet/ada", serde_json::json!(null)).await?;
//!     assert_eq!(reply.status, 200);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use transom_core as core;
pub use transom_core::*;
