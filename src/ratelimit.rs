use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CITraceError, Result};

/// Paces outbound API calls to a fixed number of calls per second.
///
/// One instance is shared by every caller in the process. Slots are handed
/// out in FIFO order (the async mutex is fair) and spaced by `1/rate` with no
/// burst allowance, so an idle period does not let a later burst through.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// Creates a limiter allowing `calls_per_second` calls. Zero disables pacing.
    pub fn new(calls_per_second: u32) -> Self {
        let interval =
            (calls_per_second > 0).then(|| Duration::from_secs(1) / calls_per_second);

        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Blocks until the next call slot is available.
    ///
    /// # Errors
    ///
    /// Returns `CITraceError::Cancelled` if `cancel` fires before the slot.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CITraceError::Cancelled);
        }

        let Some(interval) = self.interval else {
            return Ok(());
        };

        let slot = {
            let mut next = tokio::select! {
                () = cancel.cancelled() => return Err(CITraceError::Cancelled),
                guard = self.next_slot.lock() => guard,
            };
            let slot = (*next).max(Instant::now());
            *next = slot + interval;
            slot
        };

        tokio::select! {
            () = cancel.cancelled() => Err(CITraceError::Cancelled),
            () = tokio::time::sleep_until(slot) => Ok(()),
        }
    }
}
