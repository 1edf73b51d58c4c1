//! Cooperative interruption of long transfers.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A resettable "stop what you are doing" flag shared by the UI and classes.
///
/// Transfers check it between chunks. A cancelled token cannot be revived,
/// so [`reset`](Self::reset) swaps in a fresh one.
#[derive(Clone, Default)]
pub struct Interrupt {
    token: Arc<Mutex<CancellationToken>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask running transfers to stop.
    pub fn request(&self) {
        self.token.lock().cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.lock().is_cancelled()
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        *self.token.lock() = CancellationToken::new();
    }

    /// The current token, for callers that want to hand it on.
    pub fn token(&self) -> CancellationToken {
        self.token.lock().clone()
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("requested", &self.is_requested())
            .finish()
    }
}
