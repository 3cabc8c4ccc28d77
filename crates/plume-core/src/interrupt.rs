//! Cancellation flag polled by running scripts.

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

static SIGINT_FLAG: AtomicBool = AtomicBool::new(false);
static SIGINT_INIT: Once = Once::new();

/// Shared flag raised by the host to cancel the running call.
#[derive(Clone, Debug, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
        SIGINT_FLAG.store(false, Ordering::SeqCst);
    }

    /// True once raised here or by an installed SIGINT handler.
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || SIGINT_FLAG.load(Ordering::SeqCst)
    }
}

/// Routes SIGINT to every runtime's interrupt check.
pub fn install_sigint_handler() {
    #[cfg(unix)]
    SIGINT_INIT.call_once(|| unsafe {
        install_unix_signal_handler(2);
    });
}

#[cfg(unix)]
unsafe extern "C" {
    fn signal(sig: i32, handler: usize) -> usize;
}

#[cfg(unix)]
extern "C" fn handle_unix_interrupt(_sig: i32) {
    SIGINT_FLAG.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
unsafe fn install_unix_signal_handler(sig: i32) {
    let _ = unsafe { signal(sig, handle_unix_interrupt as usize) };
}
