use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use tokio::sync::oneshot;

use super::WatchEvent;
use crate::SessionError;

/// A one-shot watch armed by a read operation.
///
/// Resolves exactly once: with the event that fired it, or with
/// [`SessionError::WatchLost`] when the arming session went away first.
/// Dropping a `Watch` simply discards the notification.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

/// Sending half kept by the session until the watched property changes.
#[derive(Debug)]
pub struct WatchTrigger {
    tx: oneshot::Sender<WatchEvent>,
}

impl Watch {
    pub fn channel(path: impl Into<String>) -> (WatchTrigger, Watch) {
        let (tx, rx) = oneshot::channel();
        (WatchTrigger { tx }, Watch { path: path.into(), rx })
    }

    /// A watch that fires immediately with the given event.
    pub fn fired(event: WatchEvent) -> Watch {
        let (trigger, watch) = Watch::channel(event.path.clone());
        trigger.fire(event);
        watch
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl WatchTrigger {
    /// Returns false when nobody was listening anymore.
    pub fn fire(
        self,
        event: WatchEvent,
    ) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Future for Watch {
    type Output = std::result::Result<WatchEvent, SessionError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(event)) => Poll::Ready(Ok(event)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SessionError::WatchLost(self.path.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
