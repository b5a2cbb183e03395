use std::time::Duration;

use stservo_proto::ServoStatus;
use tokio::time::{Instant, MissedTickBehavior};

use crate::controller::ServoController;
use crate::error::ServoError;

const MIN_CHECK: Duration = Duration::from_millis(10);
const MAX_CHECK: Duration = Duration::from_secs(1);
/// Deadline used when `now + wait` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// An in-progress wait for a move to finish.
///
/// Only the cached state is inspected; arrival is detected by the status
/// poll task. Dropping the future abandons the wait and leaves the servo alone.
#[derive(Debug, Clone, Copy)]
pub struct PendingWait {
    pub target: i32,
    pub deadline: Instant,
    pub poll_interval: Duration,
    waited: Duration,
}

impl PendingWait {
    pub fn new(target: i32, wait: Duration, status_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            target,
            deadline: now.checked_add(wait).unwrap_or(now + FAR_FUTURE),
            poll_interval: status_interval.clamp(MIN_CHECK, MAX_CHECK),
            waited: wait,
        }
    }

    pub async fn resolve(self, servo: &ServoController) -> Result<ServoStatus, ServoError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let st = servo.snapshot();
            if let Some(cause) = st.fault() {
                return Err(cause.to_error(servo.name()));
            }
            if !st.is_moving {
                return Ok(st.status());
            }
            if Instant::now() >= self.deadline {
                return Err(ServoError::Timeout {
                    name: servo.name().to_string(),
                    target: self.target,
                    waited: self.waited,
                });
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(self.deadline) => {}
            }
        }
    }
}
