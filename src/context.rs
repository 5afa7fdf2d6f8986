//! The per-exchange context hooks and handlers operate on.

use bytes::Bytes;

use crate::response::ResponseObserver;
use crate::sink::ResponseSink;

/// The incoming request as the pipeline sees it.
///
/// The body is fully buffered by the transport binding before any hook runs.
pub type Request = http::Request<Bytes>;

/// One request/response exchange.
///
/// Exactly one `Context` exists per exchange. It is created when the handler
/// adapter is invoked and dropped when it returns, and it is never shared
/// between exchanges.
#[derive(Debug)]
pub struct Context {
    request: Request,
    response: ResponseObserver,
}

impl Context {
    pub(crate) fn new(request: Request, response: ResponseObserver) -> Self {
        Self { request, response }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// Replaces the request seen by every hook and handler that runs later
    /// in this exchange. Returns the previous one.
    pub fn set_request(&mut self, request: Request) -> Request {
        std::mem::replace(&mut self.request, request)
    }

    pub fn response(&self) -> &ResponseObserver {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseObserver {
        &mut self.response
    }

    /// Installs a new response observer and returns the previous one.
    ///
    /// The short-circuit check reads whichever observer is installed when it
    /// runs. A fresh observer has written nothing, so the remaining before
    /// hooks and the handler still run after the swap. Use
    /// [`wrap_response`](Self::wrap_response) to layer a sink over the
    /// current response without losing that state.
    pub fn set_response(&mut self, response: ResponseObserver) -> ResponseObserver {
        std::mem::replace(&mut self.response, response)
    }

    /// Wraps the current response in a new sink built by `wrap`.
    ///
    /// `wrap` receives the installed observer, so writes through the new
    /// sink still reach the transport. The new observer starts with the old
    /// one's status and size: a response that was already written stays
    /// written, and the short-circuit check is unaffected by the wrap.
    pub fn wrap_response<S, F>(&mut self, wrap: F)
    where
        S: ResponseSink,
        F: FnOnce(ResponseObserver) -> S,
    {
        let inner = std::mem::replace(&mut self.response, ResponseObserver::detached());
        let (status, size) = (inner.status(), inner.size());
        self.response = ResponseObserver::new(wrap(inner)).inherit(status, size);
    }
}

/// Implemented by application contexts that embed a base [`Context`].
///
/// The pipeline reaches the response through this trait to decide whether
/// to short-circuit, so the embedded context must be the one the transform
/// was given.
///
/// ```rust
/// use mixer::{AsContext, Context};
///
/// struct AppContext {
///     base: Context,
///     user: Option<String>,
/// }
///
/// impl AsContext for AppContext {
///     fn as_context(&self) -> &Context {
///         &self.base
///     }
///     fn as_context_mut(&mut self) -> &mut Context {
///         &mut self.base
///     }
/// }
/// ```
pub trait AsContext {
    fn as_context(&self) -> &Context;
    fn as_context_mut(&mut self) -> &mut Context;
}

impl AsContext for Context {
    fn as_context(&self) -> &Context {
        self
    }

    fn as_context_mut(&mut self) -> &mut Context {
        self
    }
}
