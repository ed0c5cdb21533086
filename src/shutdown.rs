//! Cooperative cancellation for the pipeline loops.
//!
//! A [`ShutdownSignal`] is held by whoever owns the lifecycle (the client
//! handle, the server's caller); cheap [`ShutdownToken`] clones are handed to
//! every spawned loop. Loops `select!` the token against their blocking
//! awaits, so shutdown interrupts an in-flight read or sleep instead of
//! waiting for the next loop iteration.

use tokio::sync::watch;

/// The owning side of a shutdown pair. Dropping it also signals shutdown.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

/// The observing side. Clone freely; one per spawned loop.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

/// Creates a connected signal/token pair.
pub fn channel() -> (ShutdownSignal, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSignal { tx }, ShutdownToken { rx })
}

impl ShutdownSignal {
    /// Signals every token. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownToken {
    /// Resolves once shutdown has been signalled (or the signal side was
    /// dropped). Safe to await repeatedly.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // An error means the sender is gone, which counts as shutdown.
        let _ = self.rx.wait_for(|&stopped| stopped).await;
    }

    /// Non-blocking check, for callers outside an async context.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_wakes_all_tokens() {
        let (signal, token) = channel();
        let mut a = token.clone();
        let mut b = token;

        let waiter = tokio::spawn(async move {
            a.cancelled().await;
            b.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("tokens did not observe shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_the_signal_cancels() {
        let (signal, mut token) = channel();
        assert!(!token.is_cancelled());
        drop(signal);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("drop did not cancel");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_is_sticky() {
        let (signal, mut token) = channel();
        signal.shutdown();
        token.cancelled().await;
        token.cancelled().await;
    }
}
