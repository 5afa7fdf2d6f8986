//! # mixer
//!
//! Before/after hooks around HTTP handlers, with a typed per-request context.
//!
//! ## The contract
//!
//! A [`Pipeline`] holds two ordered hook lists and one context transform.
//! Wrapping a terminal handler with [`Pipeline::handler`] yields a
//! [`Handler`] that, for every request:
//!
//! 1. wraps the transport's response sink in a [`ResponseObserver`],
//! 2. builds the base [`Context`] and transforms it into your context type,
//! 3. runs the before hooks in order, stopping at the first one that writes
//!    a response,
//! 4. runs the terminal handler if nothing was written,
//! 5. runs every after hook.
//!
//! Routing, body parsing, sessions, retries: none of that lives here. Hooks
//! are the extension point, the context transform is the only dependency
//! injection there is.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mixer::{AsContext, Context, Pipeline, Server};
//! use http::StatusCode;
//!
//! struct AppContext {
//!     base: Context,
//!     user: Option<String>,
//! }
//!
//! impl AsContext for AppContext {
//!     fn as_context(&self) -> &Context {
//!         &self.base
//!     }
//!     fn as_context_mut(&mut self) -> &mut Context {
//!         &mut self.base
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut app = Pipeline::new(|base| AppContext { base, user: None });
//!
//!     app.before(|c| {
//!         c.user = c.base.request().headers()
//!             .get("x-user")
//!             .and_then(|v| v.to_str().ok())
//!             .map(str::to_owned);
//!         if c.user.is_none() {
//!             c.base.response_mut().write_status(StatusCode::UNAUTHORIZED);
//!         }
//!     });
//!     app.after(|c| {
//!         tracing::info!(status = ?c.base.response().status(), "done");
//!     });
//!
//!     let hello = app.handler(|c| {
//!         let body = format!("hello, {}", c.user.as_deref().unwrap_or_default());
//!         c.base.response_mut().write(body.as_bytes()).unwrap();
//!     });
//!
//!     Server::bind("0.0.0.0:3000").unwrap().serve(hello).await.unwrap();
//! }
//! ```

mod context;
mod error;
mod handler;
mod pipeline;
mod recorder;
mod response;
mod server;
mod sink;
mod transport;

pub use context::{AsContext, Context, Request};
pub use error::{Capability, Error, Result};
pub use handler::{Handler, Hook};
pub use pipeline::Pipeline;
pub use recorder::Recorder;
pub use response::ResponseObserver;
pub use server::Server;
pub use sink::{CloseNotifier, CloseSignal, Flush, ResponseSink, Takeover, close_channel};
pub use transport::ChannelBody;
