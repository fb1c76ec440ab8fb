use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Holds the result for whichever input was requested most recently.
///
/// Each [`LatestRequest::begin`] cancels the previous token and clears the
/// held value, so a slow response for an earlier input can never overwrite
/// the result for a later one.
#[derive(Debug)]
pub struct LatestRequest<T> {
    inner: Arc<Mutex<Slot<T>>>,
}

#[derive(Debug)]
struct Slot<T> {
    token: CancellationToken,
    value: Option<T>,
}

impl<T> Clone for LatestRequest<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for LatestRequest<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slot {
                token: CancellationToken::new(),
                value: None,
            })),
        }
    }
}

impl<T> LatestRequest<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supersede any in-flight request and hand out a token for a new one.
    pub fn begin(&self) -> CancellationToken {
        let mut slot = self.inner.lock();
        slot.token.cancel();
        slot.token = CancellationToken::new();
        slot.value = None;
        slot.token.clone()
    }

    /// Store `value` if `token` is still the current one.
    pub fn commit(&self, token: &CancellationToken, value: T) -> bool {
        let mut slot = self.inner.lock();
        if token.is_cancelled() {
            return false;
        }
        slot.value = Some(value);
        true
    }

    /// Cancel the in-flight request and drop the held value.
    pub fn clear(&self) {
        let mut slot = self.inner.lock();
        slot.token.cancel();
        slot.value = None;
    }
}

impl<T: Clone> LatestRequest<T> {
    /// The committed value, if any.
    pub fn current(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }
}
