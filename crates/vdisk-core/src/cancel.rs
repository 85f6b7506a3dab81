use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Result, VdError};

/// Cooperative cancellation handle for long multi-extent operations.
///
/// Cancellation is best effort: an in-flight device read completes, and the
/// flag is consulted before each extent iteration and each overflow-index
/// probe. After a `Cancelled` failure the stream position is unspecified and
/// callers must reposition before resuming.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(VdError::Cancelled);
        }
        Ok(())
    }
}
