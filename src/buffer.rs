//! The buffer-completion callback contract and the region view handed
//! across the session boundary.

use crate::error::{Error, Result};

/// Completion callback signature: two opaque context words, the completion
/// status, and the number of bytes transferred. This narrow contract is
/// deliberate; callbacks are invoked outside every internal lock and may
/// re-enter any API on the same session.
pub type CompletionFn =
    fn(context1: usize, context2: usize, status: Result<()>, completed_bytes: usize);

/// A completion callback plus its two context words.
#[derive(Debug, Clone, Copy)]
pub struct CallbackData {
    pub function: CompletionFn,
    pub context1: usize,
    pub context2: usize,
}

impl CallbackData {
    pub(crate) fn call(&self, status: std::result::Result<(), Error>, completed_bytes: usize) {
        (self.function)(self.context1, self.context2, status, completed_bytes);
    }
}

/// Internal view of a user-held buffer: its pool index plus the memory
/// window the application may touch. The index is the buffer's identity;
/// everything else is a snapshot taken while the buffer was handed out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionView {
    pub index: usize,
    pub ptr: *mut u8,
    pub capacity: usize,
    pub used: usize,
}
