use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Single-slot rendezvous between a request and its asynchronous response.
///
/// The requester calls `reset`, sends its request and waits in `get_result`;
/// whichever layer handles the response calls `set_result`. The result stays
/// in the slot until the next `reset`.
pub struct Promise<T> {
    result: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn reset(&self) {
        *self.result.lock() = None;
    }

    /// Stores `value` and wakes every waiter.
    pub fn set_result(&self, value: T) {
        *self.result.lock() = Some(value);
        self.notify.notify_waiters();
    }

    pub fn has_result(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Waits up to `timeout` for a result. `None` means the timeout elapsed
    /// first.
    pub async fn get_result(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the slot so a concurrent set_result
            // cannot slip in between the check and the wait.
            notified.as_mut().enable();

            if let Some(value) = self.result.lock().clone() {
                return Some(value);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.result.lock().clone();
            }
        }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}
