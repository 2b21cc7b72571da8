use std::{future::Future, sync::Arc};
use tokio::sync::watch;

///
/// CancelSignal
///
/// Cooperative cancellation shared between the caller and every in-flight
/// fetch of one pull. Clones observe the same signal; once tripped it stays
/// tripped.
///

#[derive(Clone, Debug)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);

        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the signal trips.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `future` unless the signal trips first; `None` means cancelled
    /// and the future was dropped mid-flight.
    pub async fn guard<F>(&self, future: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancelled() => None,
            output = future => Some(output),
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

///
/// TESTS
///
