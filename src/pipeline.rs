//! The composition engine.
//!
//! A [`Pipeline`] is configuration: a context transform plus ordered lists
//! of before and after hooks. It does nothing on its own. Calling
//! [`Pipeline::handler`] freezes the configuration around a terminal handler
//! and returns a [`Handler`] the transport can invoke.

use std::fmt;
use std::sync::Arc;

use crate::context::{AsContext, Context};
use crate::handler::{Handler, Hook, Transform};

/// Before/after hooks around handlers over context type `T`.
///
/// # Short-circuiting
///
/// Before hooks run in insertion order until one of them writes to the
/// response. From then on the remaining before hooks and the terminal handler
/// are skipped. After hooks always all run.
///
/// ```rust
/// use http::StatusCode;
/// use mixer::{Pipeline, Recorder, Request};
///
/// let mut p = Pipeline::classic();
/// p.before(|c| {
///     if c.request().headers().get("authorization").is_none() {
///         c.response_mut().write_status(StatusCode::UNAUTHORIZED);
///     }
/// });
///
/// let handler = p.handler(|c| {
///     c.response_mut().write(b"secret").unwrap();
/// });
///
/// let rec = Recorder::new();
/// handler.serve(Request::default(), rec.clone());
/// assert_eq!(rec.code(), 401);
/// assert!(rec.body().is_empty());
/// ```
///
/// # Configuration time only
///
/// `before` and `after` take `&mut self`, and a [`Handler`] keeps its own
/// snapshot of the lists, so a pipeline cannot be changed underneath traffic
/// it is already serving. To derive a variant of a pipeline that is in use,
/// [`clone`](Clone::clone) it or use [`with`](Self::with).
pub struct Pipeline<T> {
    transform: Transform<T>,
    before: Vec<Hook<T>>,
    after: Vec<Hook<T>>,
}

impl Pipeline<Context> {
    /// A pipeline over the base [`Context`]; the transform is the identity.
    pub fn classic() -> Self {
        Self::new(|c| c)
    }
}

impl<T: AsContext + 'static> Pipeline<T> {
    /// A pipeline whose hooks see the value `transform` builds from the base
    /// context. The transform runs exactly once per exchange, before any hook.
    ///
    /// ```rust
    /// use mixer::{AsContext, Context, Pipeline};
    ///
    /// struct AppContext {
    ///     base: Context,
    ///     greeting: &'static str,
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
    ///
    /// let p = Pipeline::new(|base| AppContext { base, greeting: "hello" });
    /// let handler = p.handler(|c: &mut AppContext| {
    ///     let greeting = c.greeting;
    ///     c.base.response_mut().write(greeting.as_bytes()).unwrap();
    /// });
    /// # let _ = handler;
    /// ```
    pub fn new(transform: impl Fn(Context) -> T + Send + Sync + 'static) -> Self {
        Self { transform: Arc::new(transform), before: Vec::new(), after: Vec::new() }
    }

    /// Appends a hook that runs before the handler.
    pub fn before(&mut self, hook: impl Fn(&mut T) + Send + Sync + 'static) -> &mut Self {
        self.before.push(Arc::new(hook));
        self
    }

    /// Appends a hook that runs after the handler, whether or not anything
    /// short-circuited.
    pub fn after(&mut self, hook: impl Fn(&mut T) + Send + Sync + 'static) -> &mut Self {
        self.after.push(Arc::new(hook));
        self
    }

    /// Clones the pipeline and applies `setup` to the clone.
    ///
    /// ```rust
    /// use mixer::Pipeline;
    ///
    /// let base = Pipeline::classic();
    /// let admin = base.with(|p| {
    ///     p.before(|_c| { /* check admin role */ });
    /// });
    ///
    /// assert_eq!(base.before_count(), 0);
    /// assert_eq!(admin.before_count(), 1);
    /// ```
    pub fn with(&self, setup: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        setup(&mut next);
        next
    }

    pub fn before_count(&self) -> usize {
        self.before.len()
    }

    pub fn after_count(&self) -> usize {
        self.after.len()
    }

    /// Wraps `terminal` in this pipeline's hooks.
    ///
    /// Nothing runs here; the returned handler runs the hooks each time the
    /// transport invokes it.
    pub fn handler(&self, terminal: impl Fn(&mut T) + Send + Sync + 'static) -> Handler<T> {
        Handler {
            transform: Arc::clone(&self.transform),
            before: self.before.as_slice().into(),
            after: self.after.as_slice().into(),
            terminal: Arc::new(terminal),
        }
    }
}

/// Copies both hook lists element by element; the transform is shared.
impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            transform: Arc::clone(&self.transform),
            before: self.before.clone(),
            after: self.after.clone(),
        }
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::StatusCode;

    use super::*;
    use crate::context::Request;
    use crate::recorder::Recorder;
    use crate::response::ResponseObserver;
    use crate::sink::ResponseSink;

    type Trace = Arc<Mutex<String>>;

    fn push(trace: &Trace, s: &str) {
        trace.lock().unwrap().push_str(s);
    }

    fn recorded(trace: &Trace) -> String {
        trace.lock().unwrap().clone()
    }

    #[test]
    fn classic_writes_through() {
        let handler = Pipeline::classic().handler(|c| {
            c.response_mut().write(b"Hello, world").unwrap();
        });

        let rec = Recorder::new();
        handler.serve(Request::default(), rec.clone());

        assert_eq!(rec.code(), 200);
        assert_eq!(rec.body(), "Hello, world");
    }

    struct CustomContext {
        base: Context,
        calls: usize,
    }

    impl AsContext for CustomContext {
        fn as_context(&self) -> &Context {
            &self.base
        }
        fn as_context_mut(&mut self) -> &mut Context {
            &mut self.base
        }
    }

    #[test]
    fn custom_context_reaches_hooks_and_handler() {
        let transforms = Arc::new(Mutex::new(0));
        let counted = transforms.clone();

        let mut p = Pipeline::new(move |base| {
            *counted.lock().unwrap() += 1;
            CustomContext { base, calls: 0 }
        });
        p.before(|c: &mut CustomContext| c.calls += 1);
        p.before(|c: &mut CustomContext| c.calls += 1);

        let handler = p.handler(|c| {
            let body = format!("calls={}", c.calls);
            c.base.response_mut().write(body.as_bytes()).unwrap();
        });

        let rec = Recorder::new();
        handler.serve(Request::default(), rec.clone());

        assert_eq!(rec.code(), 200);
        assert_eq!(rec.body(), "calls=2");
        assert_eq!(*transforms.lock().unwrap(), 1);
    }

    #[test]
    fn before_handler_after_in_order() {
        let trace = Trace::default();
        let mut p = Pipeline::classic();
        let t = trace.clone();
        p.before(move |_| push(&t, "foo"));
        let t = trace.clone();
        p.before(move |_| push(&t, "bar"));
        let t = trace.clone();
        p.after(move |_| push(&t, "baz"));

        let t = trace.clone();
        let handler = p.handler(move |_| push(&t, "bat"));
        handler.serve(Request::default(), Recorder::new());

        assert_eq!(recorded(&trace), "foobarbatbaz");
    }

    #[test]
    fn writing_before_hook_short_circuits() {
        let trace = Trace::default();
        let mut p = Pipeline::classic();
        let t = trace.clone();
        p.before(move |_| push(&t, "foo"));
        let t = trace.clone();
        p.before(move |c| {
            push(&t, "bar");
            c.response_mut().write(b"Hello world").unwrap();
        });
        let t = trace.clone();
        p.before(move |_| push(&t, "never"));
        let t = trace.clone();
        p.after(move |_| push(&t, "baz"));

        let t = trace.clone();
        let handler = p.handler(move |_| push(&t, "bat"));
        let rec = Recorder::new();
        handler.serve(Request::default(), rec.clone());

        assert_eq!(recorded(&trace), "foobarbaz");
        assert_eq!(rec.body(), "Hello world");
    }

    #[test]
    fn status_only_write_also_short_circuits() {
        let trace = Trace::default();
        let mut p = Pipeline::classic();
        p.before(|c| c.response_mut().write_status(StatusCode::FORBIDDEN));
        let t = trace.clone();
        p.after(move |c| push(&t, &c.response().status().unwrap().as_u16().to_string()));

        let t = trace.clone();
        let handler = p.handler(move |_| push(&t, "handler"));
        let rec = Recorder::new();
        handler.serve(Request::default(), rec.clone());

        assert_eq!(recorded(&trace), "403");
        assert_eq!(rec.code(), 403);
    }

    #[test]
    fn after_hooks_all_run_even_when_they_write() {
        let trace = Trace::default();
        let mut p = Pipeline::classic();
        let t = trace.clone();
        p.after(move |c| {
            push(&t, "a1");
            c.response_mut().write(b"late").unwrap();
        });
        let t = trace.clone();
        p.after(move |_| push(&t, "a2"));

        let handler = p.handler(|c| c.response_mut().write_status(StatusCode::CREATED));
        let rec = Recorder::new();
        handler.serve(Request::default(), rec.clone());

        assert_eq!(recorded(&trace), "a1a2");
        assert_eq!(rec.code(), 201);
        assert_eq!(rec.body(), "late");
    }

    #[test]
    fn duplicate_hooks_run_independently() {
        let trace = Trace::default();
        let t = trace.clone();
        let hook: Hook<Context> = Arc::new(move |_: &mut Context| push(&t, "x"));

        let mut p = Pipeline::classic();
        let h = hook.clone();
        p.before(move |c| h(c));
        let h = hook.clone();
        p.before(move |c| h(c));

        p.handler(|_| {}).serve(Request::default(), Recorder::new());
        assert_eq!(recorded(&trace), "xx");
    }

    #[test]
    fn clone_is_independent() {
        let trace = Trace::default();
        let mut first = Pipeline::classic();
        let t = trace.clone();
        first.before(move |_| push(&t, "f"));

        let mut second = first.clone();
        let t = trace.clone();
        second.before(move |_| push(&t, "s"));

        second.handler(|_| {}).serve(Request::default(), Recorder::new());
        assert_eq!(recorded(&trace), "fs");

        first.handler(|_| {}).serve(Request::default(), Recorder::new());
        assert_eq!(recorded(&trace), "fsf");

        first.after(|_| {});
        assert_eq!((first.before_count(), first.after_count()), (1, 1));
        assert_eq!((second.before_count(), second.after_count()), (2, 0));
    }

    #[test]
    fn with_configures_a_clone() {
        let trace = Trace::default();
        let base = Pipeline::classic();
        let t = trace.clone();
        let variant = base.with(move |p| {
            p.after(move |_| push(&t, "after"));
        });

        base.handler(|_| {}).serve(Request::default(), Recorder::new());
        assert_eq!(recorded(&trace), "");

        variant.handler(|_| {}).serve(Request::default(), Recorder::new());
        assert_eq!(recorded(&trace), "after");
    }

    #[test]
    fn handler_keeps_its_snapshot() {
        let trace = Trace::default();
        let mut p = Pipeline::classic();
        let handler = p.handler(|_| {});

        let t = trace.clone();
        p.before(move |_| push(&t, "late"));

        handler.serve(Request::default(), Recorder::new());
        assert_eq!(recorded(&trace), "");
    }

    // Copies every body write into a trace before passing it on.
    struct Capture {
        inner: ResponseObserver,
        seen: Trace,
    }

    impl ResponseSink for Capture {
        fn headers_mut(&mut self) -> &mut http::HeaderMap {
            self.inner.headers_mut()
        }

        fn write_status(&mut self, status: StatusCode) {
            self.inner.write_status(status);
        }

        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            push(&self.seen, &String::from_utf8_lossy(buf));
            self.inner.write(buf)
        }
    }

    #[test]
    fn wrapped_response_captures_the_handler_body() {
        let seen = Trace::default();
        let mut p = Pipeline::classic();
        let t = seen.clone();
        p.before(move |c| {
            let seen = t.clone();
            c.wrap_response(move |inner| Capture { inner, seen });
        });

        let handler = p.handler(|c| {
            c.response_mut().write(b"captured").unwrap();
        });
        let rec = Recorder::new();
        handler.serve(Request::default(), rec.clone());

        assert_eq!(recorded(&seen), "captured");
        assert_eq!(rec.body(), "captured");
    }

    #[test]
    fn wrapping_after_a_write_still_short_circuits() {
        let trace = Trace::default();
        let mut p = Pipeline::classic();
        p.before(|c| c.response_mut().write_status(StatusCode::UNAUTHORIZED));
        let t = trace.clone();
        p.before(move |c| {
            let seen = t.clone();
            c.wrap_response(move |inner| Capture { inner, seen });
        });

        let t = trace.clone();
        let handler = p.handler(move |_| push(&t, "handler"));
        let rec = Recorder::new();
        handler.serve(Request::default(), rec.clone());

        assert_eq!(recorded(&trace), "");
        assert_eq!(rec.code(), 401);
    }

    #[test]
    fn set_response_with_a_fresh_observer_lets_the_handler_run() {
        let trace = Trace::default();
        let replacement = Recorder::new();
        let mut p = Pipeline::classic();
        let r = replacement.clone();
        p.before(move |c| {
            c.response_mut().write_status(StatusCode::UNAUTHORIZED);
            c.set_response(ResponseObserver::new(r.clone()));
        });

        let t = trace.clone();
        let handler = p.handler(move |c| {
            push(&t, "handler");
            c.response_mut().write(b"ok").unwrap();
        });
        let rec = Recorder::new();
        handler.serve(Request::default(), rec.clone());

        assert_eq!(recorded(&trace), "handler");
        assert_eq!(rec.code(), 401);
        assert_eq!(replacement.body(), "ok");
    }

    #[test]
    fn handler_builds_without_running_anything() {
        let trace = Trace::default();
        let mut p = Pipeline::classic();
        let t = trace.clone();
        p.before(move |_| push(&t, "before"));
        let t = trace.clone();
        let _handler = p.handler(move |_| push(&t, "handler"));

        assert_eq!(recorded(&trace), "");
    }
}
