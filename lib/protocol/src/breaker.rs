//! The single-shot fatal-error channel ("breaker") that every task in the
//! Message Pump shares. Whichever task hits a fatal condition first trips it;
//! every later trip is silently dropped, and the Cleanup task observes
//! exactly one value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::message::FatalError;

/// A clonable handle onto the breaker. Cheap to clone and pass to every task.
#[derive(Clone)]
pub struct Breaker {
    tx: mpsc::Sender<FatalError>,
    tripped: Arc<AtomicBool>,
}

/// The Cleanup task's half of the breaker.
pub struct BreakerSignal {
    rx: mpsc::Receiver<FatalError>,
}

/// Builds a fresh breaker pair: a [`Breaker`] to trip and a [`BreakerSignal`]
/// for the Cleanup task to await.
pub fn breaker() -> (Breaker, BreakerSignal) {
    let (tx, rx) = mpsc::channel(1);
    (
        Breaker {
            tx,
            tripped: Arc::new(AtomicBool::new(false)),
        },
        BreakerSignal { rx },
    )
}

impl Breaker {
    /// Trips the breaker with `err`, unless it has already been tripped, in
    /// which case this is a silent no-op. Never blocks.
    pub fn trip(&self, err: FatalError) {
        if self.tripped.swap(true, Ordering::SeqCst) {
            return;
        }
        // capacity is 1 and we are guaranteed to be the only sender to ever
        // succeed past the `tripped` guard, so this cannot fail on a full
        // channel; it can only fail if the receiver was already dropped,
        // which we tolerate silently (connection is tearing down anyway).
        let _ = self.tx.try_send(err);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

impl BreakerSignal {
    /// Waits for the first fatal error. Resolves immediately if the breaker
    /// was already tripped before this call.
    pub async fn wait(mut self) -> FatalError {
        match self.rx.recv().await {
            Some(err) => err,
            // every Breaker clone was dropped without ever tripping (e.g. the
            // connection closed normally before any fatal condition arose).
            None => FatalError::new(1000, "connection closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_trip_wins() {
        let (breaker, signal) = breaker();
        let b2 = breaker.clone();

        breaker.trip(FatalError::new(4400, "first"));
        b2.trip(FatalError::new(4409, "second"));

        let err = signal.wait().await;
        assert_eq!(err.code, 4400);
        assert_eq!(err.reason, "first");
    }

    #[test]
    fn is_tripped_reflects_state() {
        let (breaker, _signal) = breaker();
        assert!(!breaker.is_tripped());
        breaker.trip(FatalError::new(4400, "x"));
        assert!(breaker.is_tripped());
    }

    #[tokio::test]
    async fn trip_after_signal_dropped_does_not_panic() {
        let (breaker, signal) = breaker();
        drop(signal);
        // should not panic or block
        breaker.trip(FatalError::new(4400, "x"));
    }
}
