//! Cooperative stop signalling for long-running tasks.
//!
//! A [`StopHandle`] is held by whoever owns the tasks; each task gets a
//! [`StopToken`]. Dropping the handle counts as a stop.

use tokio::sync::watch;

#[derive(Debug)]
pub struct StopHandle {
    sender: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct StopToken {
    receiver: watch::Receiver<bool>,
}

impl StopHandle {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self { sender }
    }

    #[must_use]
    pub fn token(&self) -> StopToken {
        StopToken {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut receiver = self.receiver.clone();
        // A closed channel means the handle is gone, which is a stop too.
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn stop_wakes_every_token() {
        let handle = StopHandle::new();
        let first = handle.token();
        let second = first.clone();

        assert!(!first.is_stopped());

        let waiter = tokio::spawn(async move { second.stopped().await });
        handle.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("token should observe stop")
            .expect("task should not panic");
        assert!(first.is_stopped());
    }

    #[tokio::test]
    async fn dropping_handle_stops() {
        let handle = StopHandle::new();
        let token = handle.token();
        drop(handle);

        assert!(token.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), token.stopped())
            .await
            .expect("dropped handle should release waiters");
    }

    #[tokio::test]
    async fn token_taken_after_stop_is_stopped() {
        let handle = StopHandle::new();
        handle.stop();
        assert!(handle.token().is_stopped());
    }
}
