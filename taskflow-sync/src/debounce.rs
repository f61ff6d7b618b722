//! Trailing-edge debounce built on [`RequestScope`].
//!
//! Each call supersedes the previous one. A superseded call returns
//! `Err(Cancelled)` without ever running its request if it was still waiting
//! out the window, or discards the response if the request was already in
//! flight.

use std::future::Future;
use std::time::Duration;

use taskflow_core::cancel::{Cancelled, RequestScope};

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    scope: RequestScope,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            scope: RequestScope::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait out the window, then run `make()` if no newer call arrived.
    pub async fn run<F, Fut>(&self, make: F) -> Result<Fut::Output, Cancelled>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let ticket = self.scope.supersede();
        tokio::time::sleep(self.window).await;
        if !ticket.is_current() {
            return Err(Cancelled);
        }
        let output = make().await;
        ticket.settle(output)
    }

    /// Drop whatever is pending or in flight.
    pub fn cancel(&self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_only_last_call_runs() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let runs = Arc::new(AtomicU32::new(0));

        let call = |query: &'static str| {
            let debouncer = debouncer.clone();
            let runs = runs.clone();
            async move {
                debouncer
                    .run(|| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        query
                    })
                    .await
            }
        };

        let (a, b, c) = tokio::join!(call("t"), call("ta"), call("tas"));
        assert_eq!(a, Err(Cancelled));
        assert_eq!(b, Err(Cancelled));
        assert_eq!(c, Ok("tas"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_response_is_discarded() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let slow = {
            let debouncer = debouncer.clone();
            tokio::spawn(async move {
                debouncer
                    .run(|| tokio::time::sleep(Duration::from_secs(1)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.cancel();
        assert_eq!(slow.await.unwrap(), Err(Cancelled));
    }
}
