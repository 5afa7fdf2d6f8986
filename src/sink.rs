//! The raw response sink a transport hands to the pipeline.
//!
//! A sink must be able to carry a status, headers and body bytes. Everything
//! else is optional and discovered by probing: a sink advertises flushing,
//! connection takeover or close notification by returning `Some` from the
//! matching probe method. The defaults return `None`, so a minimal sink only
//! implements the three required methods.
//!
//! ```text
//! ResponseSink             required: headers_mut / write_status / write
//!   ├─ flusher()        -> Option<&mut dyn Flush>
//!   ├─ takeover()       -> Option<&mut dyn Takeover>
//!   └─ close_notifier() -> Option<CloseNotifier>
//! ```

use std::future::Future;
use std::io;

use http::{HeaderMap, StatusCode};
use hyper::upgrade::OnUpgrade;
use tokio::sync::watch;

use crate::error::Result;

/// A transport's outgoing half of one exchange.
///
/// `write_status` may be called at most once by the observer that wraps the
/// sink; the observer enforces "first status wins" so sinks need not.
pub trait ResponseSink: Send + 'static {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    fn write_status(&mut self, status: StatusCode);

    /// Writes body bytes, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        None
    }

    fn takeover(&mut self) -> Option<&mut dyn Takeover> {
        None
    }

    /// Probed once, when the sink is wrapped.
    fn close_notifier(&self) -> Option<CloseNotifier> {
        None
    }
}

/// Pushes buffered body bytes to the client.
pub trait Flush {
    fn flush(&mut self) -> io::Result<()>;
}

/// Hands the underlying connection over to the caller (HTTP upgrade).
pub trait Takeover {
    fn take_over(&mut self) -> Result<OnUpgrade>;
}

// ── Close notification ───────────────────────────────────────────────────────

/// Subscription to "the client went away".
///
/// Cheap to clone; every clone observes the same signal.
#[derive(Clone, Debug)]
pub struct CloseNotifier {
    rx: watch::Receiver<()>,
}

impl CloseNotifier {
    pub(crate) fn from_receiver(rx: watch::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Resolves once the connection is gone. The returned future owns its
    /// own subscription, so it can be spawned.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut rx = self.rx.clone();
        async move { while rx.changed().await.is_ok() {} }
    }

    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

/// Firing side of a [`CloseNotifier`]. Dropping it counts as closing.
#[derive(Debug)]
pub struct CloseSignal {
    _tx: watch::Sender<()>,
}

impl CloseSignal {
    pub fn close(self) {}
}

/// Creates a linked signal/notifier pair.
pub fn close_channel() -> (CloseSignal, CloseNotifier) {
    let (tx, rx) = watch::channel(());
    (CloseSignal { _tx: tx }, CloseNotifier::from_receiver(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifier_resolves_after_signal_closes() {
        let (signal, notifier) = close_channel();
        assert!(!notifier.is_closed());

        let waiter = tokio::spawn(notifier.closed());
        signal.close();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("notifier did not fire")
            .unwrap();
        assert!(notifier.is_closed());
    }

    #[test]
    fn clones_share_the_signal() {
        let (signal, notifier) = close_channel();
        let other = notifier.clone();
        drop(signal);
        assert!(notifier.is_closed());
        assert!(other.is_closed());
    }
}
