//! Restartable deadline over `tokio::time::Sleep`, bounding each poll step.

use std::pin::Pin;

use crate::utils::LendsetError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Restartable timer. The pinned `Sleep` can be awaited again after every
/// `restart`, which lets it sit in a `tokio::select!` branch of a loop.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    sleep: Pin<Box<Sleep>>,
}

impl Timer {
    /// Creates a timer that has already expired.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
        }
    }

    /// Moves the deadline to `dur` from now.
    pub fn restart(&mut self, dur: Duration) -> Result<(), LendsetError> {
        if dur.is_zero() {
            return Err(LendsetError::msg("invalid zero timer duration"));
        }
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Resolves once the deadline passes.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
