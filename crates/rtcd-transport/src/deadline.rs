//! Deadline cells for socket operations.
//!
//! tokio sockets have no deadlines of their own. A [`Deadline`] holds the
//! current deadline in a `watch` channel so that moving or clearing it also
//! re-arms operations that are already waiting.

use std::future::Future;
use std::io;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

/// A settable absolute deadline.
#[derive(Debug)]
pub struct Deadline {
    at: watch::Sender<Option<Instant>>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

impl Deadline {
    /// Create a cell with no deadline.
    pub fn new() -> Self {
        let (at, _) = watch::channel(None);
        Self { at }
    }

    /// Replace the deadline. `None` clears it.
    pub fn set(&self, deadline: Option<Instant>) {
        self.at.send_replace(deadline);
    }

    /// Current deadline.
    pub fn get(&self) -> Option<Instant> {
        *self.at.borrow()
    }

    /// Whether the deadline is set and has passed.
    pub fn is_expired(&self) -> bool {
        self.get().is_some_and(|at| at <= Instant::now())
    }

    /// Resolve once the deadline passes, following later changes.
    pub async fn expired(&self) {
        let mut rx = self.at.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                None => {
                    // The sender lives as long as `self`.
                    let _ = rx.changed().await;
                }
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => return,
                        _ = rx.changed() => {}
                    }
                }
            }
        }
    }

    /// Run `op`, failing with [`io::ErrorKind::TimedOut`] if the deadline
    /// passes first. An already expired deadline fails without polling `op`.
    pub async fn run<T, F>(&self, op: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        if self.is_expired() {
            return Err(timeout_error());
        }
        tokio::select! {
            biased;
            _ = self.expired() => Err(timeout_error()),
            res = op => res,
        }
    }
}

/// Error returned when a deadline expires.
pub fn timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_no_deadline_runs_op() {
        let d = Deadline::new();
        let v = d.run(async { Ok::<_, io::Error>(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_past_deadline_times_out_immediately() {
        let d = Deadline::new();
        d.set(Some(Instant::now() - Duration::from_millis(1)));
        assert!(d.is_expired());
        let err = d.run(async { Ok::<_, io::Error>(()) }).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_deadline_interrupts_pending_op() {
        let d = Deadline::new();
        d.set(Some(Instant::now() + Duration::from_millis(50)));
        let err = d
            .run(std::future::pending::<io::Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_set_while_waiting() {
        let d = Arc::new(Deadline::new());
        let waiter = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.run(std::future::pending::<io::Result<()>>()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        d.set(Some(Instant::now() + Duration::from_millis(10)));

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_deadline_does_not_fire() {
        let d = Arc::new(Deadline::new());
        d.set(Some(Instant::now() + Duration::from_millis(20)));
        let waiter = {
            let d = Arc::clone(&d);
            tokio::spawn(async move {
                d.run(async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, io::Error>(1)
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        d.set(None);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }
}
