//! Generation-counter cancellation for in-flight requests.
//!
//! A [`RequestScope`] belongs to one view or widget. Every request started in
//! the scope takes a [`Ticket`]; bumping the generation (view teardown, or a
//! newer request superseding an older one) makes every outstanding ticket
//! stale, and a stale ticket turns its response into [`Cancelled`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request was cancelled or superseded")]
pub struct Cancelled;

#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    generation: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct Ticket {
    generation: Arc<AtomicU64>,
    issued: u64,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket for the current generation. Does not invalidate anything.
    pub fn ticket(&self) -> Ticket {
        Ticket {
            generation: self.generation.clone(),
            issued: self.generation.load(Ordering::Acquire),
        }
    }

    /// Invalidate every outstanding ticket and issue a fresh one.
    pub fn supersede(&self) -> Ticket {
        let issued = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        Ticket {
            generation: self.generation.clone(),
            issued,
        }
    }

    /// Tear the scope down: all in-flight responses become no-ops.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Run `fut` in the current generation.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        let ticket = self.ticket();
        let output = fut.await;
        ticket.settle(output)
    }

    /// Run `fut` as the newest request, superseding older ones.
    pub async fn run_latest<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        let ticket = self.supersede();
        let output = fut.await;
        ticket.settle(output)
    }
}

impl Ticket {
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::Acquire) == self.issued
    }

    /// Hand `value` through only if the ticket is still current.
    pub fn settle<T>(&self, value: T) -> Result<T, Cancelled> {
        if self.is_current() {
            Ok(value)
        } else {
            log::debug!("discarding stale response (generation {})", self.issued);
            Err(Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_ticket_goes_stale_on_cancel() {
        let scope = RequestScope::new();
        let ticket = scope.ticket();
        assert!(ticket.is_current());

        scope.cancel();
        assert!(!ticket.is_current());
        assert_eq!(ticket.settle(5), Err(Cancelled));
        assert!(scope.ticket().is_current());
    }

    #[test]
    fn test_supersede_invalidates_previous() {
        let scope = RequestScope::new();
        let first = scope.supersede();
        let second = scope.supersede();

        assert!(!first.is_current());
        assert!(second.is_current());
        assert_eq!(scope.generation(), 2);
    }

    #[tokio::test]
    async fn test_teardown_discards_in_flight_response() {
        let scope = RequestScope::new();
        let (tx, rx) = oneshot::channel::<&str>();

        let view = scope.clone();
        let pending = tokio::spawn(async move { view.run(async { rx.await.unwrap() }).await });

        tokio::task::yield_now().await;
        scope.cancel();
        tx.send("late response").unwrap();

        assert_eq!(pending.await.unwrap(), Err(Cancelled));
    }

    #[tokio::test]
    async fn test_newer_request_wins() {
        let scope = RequestScope::new();
        let (slow_tx, slow_rx) = oneshot::channel::<u32>();

        let s = scope.clone();
        let slow = tokio::spawn(async move { s.run_latest(async { slow_rx.await.unwrap() }).await });
        tokio::task::yield_now().await;

        let fast = scope.run_latest(async { 2 }).await;
        slow_tx.send(1).unwrap();

        assert_eq!(fast, Ok(2));
        assert_eq!(slow.await.unwrap(), Err(Cancelled));
    }
}
