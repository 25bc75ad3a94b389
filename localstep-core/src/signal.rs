//! Cooperative abort signalling.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalInner {
    aborted: AtomicBool,
    notify: Notify,
}

/// A cloneable abort flag that can also be awaited.
///
/// A child signal fires when either it or any ancestor is aborted, which lets
/// a Parallel or Map state cancel its own branches without touching the rest
/// of the execution.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
    parent: Option<Box<AbortSignal>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal that also observes this one.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(SignalInner::default()),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Fires the signal and wakes every waiter.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|p| p.is_aborted())
    }

    /// Resolves once this signal or an ancestor fires.
    pub fn aborted(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match &self.parent {
                None => self.own_abort().await,
                Some(parent) => {
                    tokio::select! {
                        _ = self.own_abort() => {}
                        _ = parent.aborted() => {}
                    }
                }
            }
        })
    }

    /// Sleeps for `duration` unless aborted first. Returns false on abort.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_aborted() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.aborted() => false,
        }
    }

    async fn own_abort(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent abort is not missed.
            notified.as_mut().enable();
            if self.inner.aborted.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}
