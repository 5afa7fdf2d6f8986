//! Response observation.
//!
//! Hooks need to know whether somebody already answered the request. The
//! raw sink a transport hands over cannot tell them, so the pipeline wraps it
//! in a [`ResponseObserver`] that records the committed status and the number
//! of body bytes that went through it.

use std::fmt;
use std::io;

use http::{HeaderMap, StatusCode};
use hyper::upgrade::OnUpgrade;
use tracing::debug;

use crate::error::{Capability, Error, Result};
use crate::sink::{CloseNotifier, Flush, ResponseSink, Takeover};

/// A [`ResponseSink`] wrapper that remembers what was written.
///
/// # Status rules
///
/// - [`status`](Self::status) is `None` until the first commit.
/// - The first status committed wins. Later [`write_status`](Self::write_status)
///   calls are ignored.
/// - [`write`](Self::write) without a prior status commits `200 OK` first.
/// - [`flush`](Self::flush) counts as a commit, and also defaults to `200 OK`.
///
/// ```rust
/// use std::io::Write;
/// use http::StatusCode;
/// use mixer::{Recorder, ResponseObserver};
///
/// let rec = Recorder::new();
/// let mut rw = ResponseObserver::new(rec.clone());
///
/// write!(rw, "Hello world").unwrap();
/// rw.write_status(StatusCode::NOT_FOUND); // too late, ignored
///
/// assert_eq!(rw.status(), Some(StatusCode::OK));
/// assert_eq!(rw.size(), 11);
/// assert_eq!(rec.body(), "Hello world");
/// ```
pub struct ResponseObserver {
    sink: Box<dyn ResponseSink>,
    status: Option<StatusCode>,
    size: usize,
    // Probed once at wrap time.
    flush: bool,
    // `None` means the capability does not exist for this exchange.
    close: Option<CloseNotifier>,
}

impl ResponseObserver {
    pub fn new(sink: impl ResponseSink) -> Self {
        Self::from_boxed(Box::new(sink))
    }

    pub fn from_boxed(mut sink: Box<dyn ResponseSink>) -> Self {
        let flush = sink.flusher().is_some();
        let close = sink.close_notifier();
        Self { sink, status: None, size: 0, flush, close }
    }

    /// Carries an earlier observer's status and size over to this one, so a
    /// re-wrapped response still reads as written.
    pub(crate) fn inherit(mut self, status: Option<StatusCode>, size: usize) -> Self {
        self.status = status;
        self.size = size;
        self
    }

    /// Stand-in held by a [`Context`](crate::Context) while its observer is
    /// being re-wrapped.
    pub(crate) fn detached() -> Self {
        Self::new(Detached(HeaderMap::new()))
    }

    /// The committed status, or `None` if nothing was written yet.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn written(&self) -> bool {
        self.status.is_some()
    }

    /// Body bytes written so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Response headers. Changes made after the first commit do not reach
    /// the client.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.sink.headers_mut()
    }

    /// Commits `status` unless a status was already committed.
    pub fn write_status(&mut self, status: StatusCode) {
        if self.written() {
            return;
        }
        self.status = Some(status);
        self.sink.write_status(status);
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.written() {
            self.write_status(StatusCode::OK);
        }
        let n = self.sink.write(buf)?;
        self.size += n;
        Ok(n)
    }

    /// Whether the sink offered flushing when it was wrapped.
    pub fn can_flush(&self) -> bool {
        self.flush
    }

    /// Flushes buffered bytes to the client, committing `200 OK` if nothing
    /// was committed yet.
    ///
    /// Fails with [`Error::Unsupported`] when the sink cannot flush; the
    /// status is left untouched in that case.
    pub fn flush(&mut self) -> Result<()> {
        if !self.can_flush() {
            debug!("flush requested on a sink without flush support");
            return Err(Error::Unsupported(Capability::Flush));
        }
        if !self.written() {
            self.write_status(StatusCode::OK);
        }
        if let Some(flusher) = self.sink.flusher() {
            flusher.flush()?;
        }
        Ok(())
    }

    /// Takes over the underlying connection.
    ///
    /// The returned future resolves once the transport has sent the response
    /// head, so callers normally commit `101 Switching Protocols` next.
    pub fn take_over(&mut self) -> Result<OnUpgrade> {
        match self.sink.takeover() {
            Some(takeover) => takeover.take_over(),
            None => {
                debug!("takeover requested on a sink without takeover support");
                Err(Error::Unsupported(Capability::Takeover))
            }
        }
    }

    /// Close notification, present only when the wrapped sink offers it.
    pub fn close_notifier(&self) -> Option<&CloseNotifier> {
        self.close.as_ref()
    }
}

impl io::Write for ResponseObserver {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseObserver::write(self, buf)
    }

    /// A sink without flush support has nothing to push, so this is a no-op
    /// for it rather than an error.
    fn flush(&mut self) -> io::Result<()> {
        match ResponseObserver::flush(self) {
            Ok(()) | Err(Error::Unsupported(_)) => Ok(()),
            Err(Error::Io(e)) => Err(e),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

// An observer is itself a sink, so a hook can wrap the current response
// (compression, body capture) and install the wrapper with
// `Context::wrap_response`. Capabilities pass through unchanged.
impl ResponseSink for ResponseObserver {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        ResponseObserver::headers_mut(self)
    }

    fn write_status(&mut self, status: StatusCode) {
        ResponseObserver::write_status(self, status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseObserver::write(self, buf)
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        if !self.flush {
            return None;
        }
        Some(self)
    }

    fn takeover(&mut self) -> Option<&mut dyn Takeover> {
        self.sink.takeover()?;
        Some(self)
    }

    fn close_notifier(&self) -> Option<CloseNotifier> {
        self.close.clone()
    }
}

impl Flush for ResponseObserver {
    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(self)
    }
}

impl Takeover for ResponseObserver {
    fn take_over(&mut self) -> Result<OnUpgrade> {
        ResponseObserver::take_over(self)
    }
}

struct Detached(HeaderMap);

impl ResponseSink for Detached {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.0
    }

    fn write_status(&mut self, _status: StatusCode) {}

    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "response is being re-wrapped"))
    }
}

impl fmt::Debug for ResponseObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseObserver")
            .field("status", &self.status)
            .field("size", &self.size)
            .field("flush", &self.flush)
            .field("close_notify", &self.close.is_some())
            .finish_non_exhaustive()
    }
}
