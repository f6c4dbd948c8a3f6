//! Cooperative cancellation of engine calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::InterruptHandle;
use tracing::debug;

use crate::types::{Result, StrataError};

/// Shared flag that cancels the engine call it is attached to.
///
/// Clones observe the same flag. Canceling interrupts the statement that is
/// currently stepping, and every later call made with the signal fails with
/// [`StrataError::Canceled`].
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    canceled: AtomicBool,
    attached: Mutex<Option<InterruptHandle>>,
}

impl CancellationSignal {
    /// Creates a signal that has not been canceled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the operation. Idempotent.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.attached.lock().as_ref() {
            debug!("interrupting running statement");
            handle.interrupt();
        }
    }

    /// True once [`CancellationSignal::cancel`] has been called.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Fails with [`StrataError::Canceled`] if the signal fired.
    pub fn throw_if_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            Err(StrataError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Registers the connection's interrupt handle for the duration of a call.
    pub(crate) fn attach(&self, handle: InterruptHandle) -> Result<AttachedSignal<'_>> {
        let mut attached = self.inner.attached.lock();
        self.throw_if_canceled()?;
        *attached = Some(handle);
        Ok(AttachedSignal { signal: self })
    }
}

impl std::fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Detaches the interrupt handle when the engine call returns.
pub(crate) struct AttachedSignal<'a> {
    signal: &'a CancellationSignal,
}

impl Drop for AttachedSignal<'_> {
    fn drop(&mut self) {
        self.signal.inner.attached.lock().take();
    }
}
