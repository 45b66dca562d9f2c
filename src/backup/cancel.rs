use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared "cancel requested" flag.
///
/// Once set it stays set. Long-running loops call [`CancellationToken::checkpoint`] between
/// units of work, which turns the flag into [`Error::Cancelled`] so `?` unwinds the stack.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
