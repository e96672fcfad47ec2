//! Serialization of cache refreshes.
//!
//! Only one refresh runs at a time. Every caller takes a ticket when it asks
//! for a refresh; a refresh that *starts* after a ticket was issued satisfies
//! that ticket, because it reads chain state at least as new as the request.
//! Callers queued behind a running refresh therefore collapse into a single
//! trailing refresh instead of each re-reading the chain.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::errors::Result;

#[derive(Debug, Default)]
pub struct RefreshGate {
    running: Mutex<()>,
    requested: AtomicU64,
    completed: AtomicU64,
}

/// What a call to [`RefreshGate::run`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This caller ran the refresh itself.
    Performed,
    /// A refresh that started after this request already completed.
    Coalesced,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `refresh` unless a refresh that began after this call has already
    /// succeeded. A failed refresh satisfies nobody: queued callers retry on
    /// their own turn.
    pub async fn run<F, Fut>(&self, refresh: F) -> Result<RefreshOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = self.running.lock().await;

        if self.completed.load(Ordering::SeqCst) >= ticket {
            return Ok(RefreshOutcome::Coalesced);
        }

        // Every ticket issued up to here predates the reads below.
        let covers = self.requested.load(Ordering::SeqCst);
        refresh().await?;
        self.completed.fetch_max(covers, Ordering::SeqCst);
        Ok(RefreshOutcome::Performed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::errors::SyncError;

    #[tokio::test]
    async fn sequential_calls_each_refresh() {
        let gate = RefreshGate::new();
        for _ in 0..3 {
            let outcome = gate.run(|| async { Ok(()) }).await.unwrap();
            assert_eq!(outcome, RefreshOutcome::Performed);
        }
    }

    #[tokio::test]
    async fn queued_callers_collapse_into_one_trailing_refresh() {
        let gate = Arc::new(RefreshGate::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                gate.run(|| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let followers: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    gate.run(|| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), RefreshOutcome::Performed);

        let mut performed = 0;
        for follower in followers {
            if follower.await.unwrap().unwrap() == RefreshOutcome::Performed {
                performed += 1;
            }
        }
        assert_eq!(performed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_does_not_satisfy_later_tickets() {
        let gate = RefreshGate::new();
        let err = gate
            .run(|| async { Err(SyncError::ChainRead("connection reset".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "chain_read");

        let outcome = gate.run(|| async { Ok(()) }).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Performed);
    }
}
