//! hyper binding.
//!
//! Hooks and handlers are plain synchronous closures and may block, so each
//! exchange runs on tokio's blocking pool. The two sides talk through three
//! channels:
//!
//! ```text
//!  blocking thread (StreamSink)            async side (Handler::respond)
//!  ───────────────────────────             ─────────────────────────────
//!  first status commit ── oneshot<Head> ──▶ builds http::Response
//!  flush / 8 KiB buffer ── mpsc<Bytes> ───▶ ChannelBody frames
//!  CloseNotifier ◀──────── watch<()> ───── dropped with ChannelBody
//! ```
//!
//! The response head therefore leaves as soon as a hook commits a status,
//! and body bytes stream out on every flush while the handler keeps running.
//! The body queue is bounded: a writer that outpaces the client blocks its
//! own thread until hyper takes a frame.
//!
//! An exchange that panics before the head is sent re-raises the panic on
//! the connection task. One that panics later ends the body with an error,
//! so hyper aborts the stream instead of finishing a truncated response.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Poll, ready};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::service::Service;
use hyper::upgrade::OnUpgrade;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::AsContext;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::sink::{CloseNotifier, Flush, ResponseSink, Takeover};

/// Buffered body bytes are sent once they reach this size even without an
/// explicit flush.
const FLUSH_THRESHOLD: usize = 8 * 1024;

/// Chunks queued between the exchange and hyper before writes block.
const QUEUE_DEPTH: usize = 16;

type Head = (StatusCode, HeaderMap);

// ── Service ──────────────────────────────────────────────────────────────────

impl<T, B> Service<http::Request<B>> for Handler<T>
where
    T: AsContext + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: fmt::Display,
{
    type Response = http::Response<ChannelBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Infallible>> + Send>>;

    fn call(&self, req: http::Request<B>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.respond(req).await) })
    }
}

impl<T: AsContext + 'static> Handler<T> {
    async fn respond<B>(self, mut req: http::Request<B>) -> http::Response<ChannelBody>
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let (parts, body) = req.into_parts();

        let request = match body.collect().await {
            Ok(collected) => Some(http::Request::from_parts(parts, collected.to_bytes())),
            Err(e) => {
                warn!("failed to read request body: {e}");
                None
            }
        };

        let (mut sink, head, mut body) = StreamSink::new(upgrade);
        let task = match request {
            Some(request) => Some(tokio::task::spawn_blocking(move || self.serve(request, sink))),
            None => {
                // Empty buffer: dropping here never waits on the queue.
                sink.write_status(StatusCode::BAD_REQUEST);
                drop(sink);
                None
            }
        };

        let (status, headers) = match head.await {
            Ok(head) => {
                body.task = task;
                head
            }
            // The sink only goes away without a head when the exchange
            // panicked; hand the panic to the connection task.
            Err(_) => {
                if let Some(task) = task {
                    if let Err(e) = task.await {
                        if e.is_panic() {
                            std::panic::resume_unwind(e.into_panic());
                        }
                    }
                }
                (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())
            }
        };

        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

// ── Body ─────────────────────────────────────────────────────────────────────

/// Response body fed by the exchange's sink.
///
/// Dropping it (hyper does so when the client disconnects or the response is
/// done) fires the exchange's close notification. If the exchange panics
/// after the head was sent, the last frame is an error.
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
    task: Option<JoinHandle<()>>,
    _closed: watch::Sender<()>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        let this = self.get_mut();
        if let Some(chunk) = ready!(this.rx.poll_recv(cx)) {
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }

        // Queue closed: the sink is gone. Tell a clean end from a panic.
        if let Some(task) = this.task.as_mut() {
            let outcome = ready!(Pin::new(task).poll(cx));
            this.task = None;
            if let Err(e) = outcome {
                if e.is_panic() {
                    error!("exchange panicked after the response head was sent");
                    return Poll::Ready(Some(Err(io::Error::other(
                        "exchange panicked mid-response",
                    ))));
                }
            }
        }
        Poll::Ready(None)
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────────

/// The raw sink handed to the pipeline for a hyper exchange.
///
/// Sending body chunks blocks the calling thread while the queue is full, so
/// a sink holding buffered bytes must be written and dropped off the async
/// runtime.
pub(crate) struct StreamSink {
    headers: HeaderMap,
    head: Option<oneshot::Sender<Head>>,
    tx: mpsc::Sender<Bytes>,
    buf: BytesMut,
    upgradable: bool,
    upgrade: Option<OnUpgrade>,
    close: CloseNotifier,
}

impl StreamSink {
    pub(crate) fn new(upgrade: Option<OnUpgrade>) -> (Self, oneshot::Receiver<Head>, ChannelBody) {
        let (head_tx, head_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (closed_tx, closed_rx) = watch::channel(());

        let sink = Self {
            headers: HeaderMap::new(),
            head: Some(head_tx),
            tx,
            buf: BytesMut::new(),
            upgradable: upgrade.is_some(),
            upgrade,
            close: CloseNotifier::from_receiver(closed_rx),
        };
        let body = ChannelBody { rx, task: None, _closed: closed_tx };
        (sink, head_rx, body)
    }

    fn send_head(&mut self, status: StatusCode) {
        if let Some(head) = self.head.take() {
            // A closed receiver means the service future is gone; the body
            // channel reports that on the next write.
            let _ = head.send((status, std::mem::take(&mut self.headers)));
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.tx
            .blocking_send(self.buf.split().freeze())
            .map_err(|_| disconnected())
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

impl ResponseSink for StreamSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        self.send_head(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(disconnected());
        }
        self.send_head(StatusCode::OK);
        self.buf.extend_from_slice(buf);
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.send_buffered()?;
        }
        Ok(buf.len())
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        Some(self)
    }

    fn takeover(&mut self) -> Option<&mut dyn Takeover> {
        if !self.upgradable {
            return None;
        }
        Some(self)
    }

    fn close_notifier(&self) -> Option<CloseNotifier> {
        Some(self.close.clone())
    }
}

impl Flush for StreamSink {
    fn flush(&mut self) -> io::Result<()> {
        self.send_head(StatusCode::OK);
        self.send_buffered()
    }
}

impl Takeover for StreamSink {
    fn take_over(&mut self) -> Result<OnUpgrade> {
        debug!("connection takeover requested");
        self.upgrade.take().ok_or(Error::AlreadyTakenOver)
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        // On panic: no head, so the service can re-raise it, and no
        // buffered bytes, since the body is going to end in an error.
        if std::thread::panicking() {
            return;
        }
        self.send_head(StatusCode::OK);
        let _ = self.send_buffered();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    // Sinks send with `blocking_send`, so these tests stay off the runtime.

    #[test]
    fn drop_without_writes_sends_ok_and_empty_body() {
        let (sink, head, mut body) = StreamSink::new(None);
        drop(sink);

        let (status, _) = head.blocking_recv().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(body.rx.blocking_recv().is_none());
    }

    #[test]
    fn small_writes_wait_for_flush() {
        let (mut sink, head, mut body) = StreamSink::new(None);
        sink.headers_mut().insert("content-type", "text/plain".parse().unwrap());
        sink.write(b"abc").unwrap();

        let (status, headers) = head.blocking_recv().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert!(body.rx.try_recv().is_err());

        Flush::flush(&mut sink).unwrap();
        assert_eq!(body.rx.try_recv().unwrap(), "abc");
    }

    #[test]
    fn large_writes_are_sent_without_flush() {
        let (mut sink, _head, mut body) = StreamSink::new(None);
        let chunk = vec![b'x'; FLUSH_THRESHOLD];
        sink.write(&chunk).unwrap();

        assert_eq!(body.rx.try_recv().unwrap().len(), FLUSH_THRESHOLD);
    }

    #[test]
    fn full_queue_holds_the_writer_back() {
        let (mut sink, _head, mut body) = StreamSink::new(None);
        let sent = Arc::new(AtomicUsize::new(0));

        let counter = sent.clone();
        let writer = thread::spawn(move || {
            let chunk = vec![b'x'; FLUSH_THRESHOLD];
            for _ in 0..=QUEUE_DEPTH {
                sink.write(&chunk).unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..500 {
            if sent.load(Ordering::SeqCst) == QUEUE_DEPTH {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sent.load(Ordering::SeqCst), QUEUE_DEPTH);

        assert!(body.rx.blocking_recv().is_some());
        writer.join().unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), QUEUE_DEPTH + 1);
    }

    #[test]
    fn dropped_body_fails_writes_and_fires_close() {
        let (mut sink, _head, body) = StreamSink::new(None);
        let notifier = sink.close_notifier().unwrap();
        drop(body);

        assert!(notifier.is_closed());
        let err = sink.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn takeover_only_once() {
        let upgrade = hyper::upgrade::on(http::Request::new(()));
        let (mut sink, _head, _body) = StreamSink::new(Some(upgrade));

        let takeover = sink.takeover().unwrap();
        assert!(takeover.take_over().is_ok());
        assert!(matches!(takeover.take_over(), Err(Error::AlreadyTakenOver)));
    }

    #[test]
    fn no_upgrade_no_takeover() {
        let (mut sink, _head, _body) = StreamSink::new(None);
        assert!(sink.takeover().is_none());
    }
}
