use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::controller::HaltController;
use crate::error::HaltError;

/// Halt freshness for long-running operations.
///
/// Call [`HaltGuard::ensure`] between steps; the controller is re-checked
/// whenever more than `freshness` has passed since the last check.
pub struct HaltGuard {
    controller: Arc<HaltController>,
    freshness: Duration,
    last_checked: Mutex<DateTime<Utc>>,
}

impl HaltGuard {
    pub async fn acquire(controller: Arc<HaltController>, freshness: Duration) -> Result<Self, HaltError> {
        controller.check().await?;
        let now = controller.clock().now();
        Ok(Self {
            controller,
            freshness,
            last_checked: Mutex::new(now),
        })
    }

    pub async fn ensure(&self) -> Result<(), HaltError> {
        let now = self.controller.clock().now();
        let stale = {
            let last = self.last_checked.lock().unwrap_or_else(|e| e.into_inner());
            now - *last > self.freshness
        };
        if stale {
            self.controller.check().await?;
            *self.last_checked.lock().unwrap_or_else(|e| e.into_inner()) = now;
        }
        Ok(())
    }

    pub fn last_checked(&self) -> DateTime<Utc> {
        *self.last_checked.lock().unwrap_or_else(|e| e.into_inner())
    }
}
