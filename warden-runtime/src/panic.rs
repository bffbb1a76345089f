//! Panic Capture
//!
//! Worker threads run every task through [`catch_panic`] so a panicking
//! task fails only its own result channel. The payload is reduced to a
//! message string, and the worker carries on with its queue.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

/// Information about a caught panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicInfo {
    /// Panic message, or a placeholder for non-string payloads.
    message: String,
    /// Thread name where the panic occurred.
    thread_name: Option<String>,
}

impl PanicInfo {
    /// Get the panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the thread name, if the thread was named.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }
}

/// Run `f`, converting a panic into `Err(PanicInfo)`.
pub fn catch_panic<F, R>(f: F) -> Result<R, PanicInfo>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| PanicInfo {
        message: payload_message(payload.as_ref()),
        thread_name: thread::current().name().map(str::to_owned),
    })
}

/// Extract a readable message from a panic payload.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
