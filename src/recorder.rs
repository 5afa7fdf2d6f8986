//! An in-memory [`ResponseSink`] for tests.
//!
//! `Recorder` is cheap to clone and every clone shares the same recording,
//! so a test keeps one clone and hands the other to the code under test:
//!
//! ```rust
//! use mixer::{Pipeline, Recorder, Request};
//!
//! let handler = Pipeline::classic().handler(|c| {
//!     c.response_mut().write(b"Hello, world").unwrap();
//! });
//!
//! let rec = Recorder::new();
//! handler.serve(Request::default(), rec.clone());
//!
//! assert_eq!(rec.code(), 200);
//! assert_eq!(rec.body(), "Hello, world");
//! ```

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::sink::{CloseNotifier, CloseSignal, Flush, ResponseSink, close_channel};

/// Records status, headers and body written through it.
///
/// Supports flushing. Close notification is available only on recorders
/// built with [`Recorder::with_close_notify`]. Takeover is never supported.
#[derive(Clone, Default)]
pub struct Recorder {
    headers: HeaderMap,
    shared: Arc<Mutex<Recorded>>,
    close: Option<CloseNotifier>,
}

#[derive(Default)]
struct Recorded {
    status: Option<StatusCode>,
    // Snapshot taken when the status is committed.
    headers: HeaderMap,
    body: BytesMut,
    flushed: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that also offers close notification, plus the signal
    /// that fires it.
    pub fn with_close_notify() -> (Self, CloseSignal) {
        let (signal, notifier) = close_channel();
        let rec = Self { close: Some(notifier), ..Self::default() };
        (rec, signal)
    }

    /// The committed status, or `None` if nothing was committed.
    pub fn status(&self) -> Option<StatusCode> {
        self.lock().status
    }

    /// The status a client would have seen: `200` when nothing was committed.
    pub fn code(&self) -> u16 {
        self.status().unwrap_or(StatusCode::OK).as_u16()
    }

    /// Headers as they were at commit time.
    pub fn headers(&self) -> HeaderMap {
        self.lock().headers.clone()
    }

    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().body)
    }

    pub fn flushed(&self) -> bool {
        self.lock().flushed
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, recorded: &mut Recorded, status: StatusCode) {
        if recorded.status.is_none() {
            recorded.status = Some(status);
            recorded.headers = self.headers.clone();
        }
    }
}

impl ResponseSink for Recorder {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        let mut recorded = self.lock();
        self.commit(&mut recorded, status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut recorded = self.lock();
        self.commit(&mut recorded, StatusCode::OK);
        recorded.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        Some(self)
    }

    fn close_notifier(&self) -> Option<CloseNotifier> {
        self.close.clone()
    }
}

impl Flush for Recorder {
    fn flush(&mut self) -> io::Result<()> {
        let mut recorded = self.lock();
        self.commit(&mut recorded, StatusCode::OK);
        recorded.flushed = true;
        Ok(())
    }
}
