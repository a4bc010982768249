//! Cooperative cancellation for in-flight CVR updates.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Shared flag checked at suspension points.
///
/// An update borrows a flag for its duration; the owner flips it to abort the
/// update at its next suspension point. The flag carries no notification
/// machinery on purpose: all suspension points already wake regularly.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once the flag has been raised.
    pub fn bail(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flag_is_shared() {
        let flag = CancellationFlag::new();
        let other = flag.clone();

        assert_eq!(flag.bail(), Ok(()));
        other.cancel();
        assert_eq!(flag.bail(), Err(Cancelled));
    }
}
