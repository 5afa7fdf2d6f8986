//! Hook storage and the handler adapter.
//!
//! # How hooks are stored
//!
//! A pipeline holds hooks of many different closure types in one list, so
//! every hook is erased behind `Arc<dyn Fn(&mut T)>`:
//!
//! ```text
//! pipeline.before(|c| { … })        ← user writes this
//!        ↓
//! Arc::new(closure)                 ← Hook<T>, one allocation at startup
//!        ↓  pipeline.handler(h)
//! Arc<[Hook<T>]>                    ← frozen snapshot inside Handler<T>
//!        ↓
//! handler.serve(req, sink)          ← one virtual call per hook per request
//! ```
//!
//! Copying a list therefore copies references, never the closures or
//! anything they captured.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::context::{AsContext, Context, Request};
use crate::response::ResponseObserver;
use crate::sink::ResponseSink;

/// A before/after hook or terminal handler over context type `T`.
pub type Hook<T> = Arc<dyn Fn(&mut T) + Send + Sync + 'static>;

/// Builds the typed context from the base one. Shared, never copied.
pub(crate) type Transform<T> = Arc<dyn Fn(Context) -> T + Send + Sync + 'static>;

/// A terminal handler wrapped in a pipeline's hooks.
///
/// Obtained from [`Pipeline::handler`](crate::Pipeline::handler). Holds a
/// snapshot of the pipeline's hook lists taken at that moment: hooks added to
/// the pipeline afterwards are not seen here. Cloning is cheap and every clone
/// can serve concurrent exchanges, since serving only reads the snapshot.
///
/// Register it with a hyper connection directly (it implements
/// [`hyper::service::Service`]) or hand it to [`Server::serve`](crate::Server::serve).
pub struct Handler<T> {
    pub(crate) transform: Transform<T>,
    pub(crate) before: Arc<[Hook<T>]>,
    pub(crate) after: Arc<[Hook<T>]>,
    pub(crate) terminal: Hook<T>,
}

impl<T: AsContext + 'static> Handler<T> {
    /// Runs one exchange against `sink`.
    ///
    /// 1. Wrap `sink` in a fresh [`ResponseObserver`] and build the base
    ///    [`Context`].
    /// 2. Apply the transform.
    /// 3. Run before hooks in order, stopping as soon as the response is
    ///    written.
    /// 4. Run the terminal handler unless the response is written.
    /// 5. Run every after hook, unconditionally.
    ///
    /// Panics in hooks or the handler are not caught.
    pub fn serve(&self, request: Request, sink: impl ResponseSink) {
        self.serve_boxed(request, Box::new(sink));
    }

    pub fn serve_boxed(&self, request: Request, sink: Box<dyn ResponseSink>) {
        let response = ResponseObserver::from_boxed(sink);
        let mut ctx = (self.transform)(Context::new(request, response));

        for (i, before) in self.before.iter().enumerate() {
            if written(&ctx) {
                trace!(
                    skipped = self.before.len() - i,
                    "response written, skipping before hooks"
                );
                break;
            }
            before(&mut ctx);
        }

        if written(&ctx) {
            trace!("response written, skipping handler");
        } else {
            (self.terminal)(&mut ctx);
        }

        for after in self.after.iter() {
            after(&mut ctx);
        }
    }
}

fn written<T: AsContext>(ctx: &T) -> bool {
    ctx.as_context().response().written()
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        Self {
            transform: Arc::clone(&self.transform),
            before: Arc::clone(&self.before),
            after: Arc::clone(&self.after),
            terminal: Arc::clone(&self.terminal),
        }
    }
}

impl<T> fmt::Debug for Handler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish_non_exhaustive()
    }
}
