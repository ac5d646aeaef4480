//! Cooperative cancellation for a running scan.
//!
//! A scan can be interrupted from outside at any suspension point. The
//! [`AbortToken`] counts interrupt requests on a watch channel so that every
//! waiter observes each request exactly once: the stop phase of the
//! iteration protocol uses this to absorb a bounded number of interrupts
//! before honoring them, giving stop handlers a chance to finish.

use tokio::sync::watch;

/// Shared handle used to request the abort of a scan.
///
/// Cloning is cheap; all clones refer to the same counter. Each call to
/// [`abort`](AbortToken::abort) is delivered to every listener once.
#[derive(Clone, Debug)]
pub struct AbortToken {
    tx: watch::Sender<u64>,
}

impl Default for AbortToken {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Request the abort of the scan. May be called repeatedly; an insisting
    /// caller can overcome the stop phase's masking.
    pub fn abort(&self) {
        self.tx.send_modify(|count| *count += 1);
    }

    /// Whether at least one abort has been requested.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow() > 0
    }

    /// Create a listener that consumes abort requests one at a time.
    pub fn listener(&self) -> AbortListener {
        let rx = self.tx.subscribe();
        let seen = *rx.borrow();
        AbortListener { rx, seen }
    }
}

/// Consumes abort requests from an [`AbortToken`].
///
/// Each `aborted().await` resolves once per abort request that this
/// listener has not consumed yet, so masking N kills is just awaiting N
/// extra times.
pub struct AbortListener {
    rx: watch::Receiver<u64>,
    seen: u64,
}

impl AbortListener {
    /// Wait for the next unconsumed abort request.
    ///
    /// Pends forever if the scan is never aborted, which makes it suitable
    /// as a `select!` arm next to task completion.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow() > self.seen {
                self.seen += 1;
                return;
            }
            if self.rx.changed().await.is_err() {
                // Token dropped: nobody can abort us anymore.
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Non-blocking check, consuming one pending request if present.
    pub fn try_consume(&mut self) -> bool {
        if *self.rx.borrow() > self.seen {
            self.seen += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_wakes_listener() {
        let token = AbortToken::new();
        let mut listener = token.listener();

        token.abort();
        tokio::time::timeout(Duration::from_millis(100), listener.aborted())
            .await
            .expect("listener should see the abort");
        assert!(token.is_aborted());
    }

    #[tokio::test]
    async fn test_each_request_consumed_once() {
        let token = AbortToken::new();
        let mut listener = token.listener();

        token.abort();
        token.abort();

        assert!(listener.try_consume());
        assert!(listener.try_consume());
        assert!(!listener.try_consume());
    }

    #[tokio::test]
    async fn test_listener_pends_without_abort() {
        let token = AbortToken::new();
        let mut listener = token.listener();

        let waited =
            tokio::time::timeout(Duration::from_millis(50), listener.aborted()).await;
        assert!(waited.is_err(), "no abort requested, listener must pend");
    }

    #[tokio::test]
    async fn test_late_listener_sees_only_new_requests() {
        let token = AbortToken::new();
        token.abort();

        // A listener created after the fact starts from the current count.
        let mut listener = token.listener();
        assert!(!listener.try_consume());

        token.abort();
        assert!(listener.try_consume());
    }
}
