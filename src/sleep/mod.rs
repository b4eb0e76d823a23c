//! Sleep Detector (C8): a wall-clock watchdog that notices when the process
//! was suspended (laptop lid closed, container paused) rather than merely
//! busy, and fires a wakeup so IMAP workers exit IDLE and resynchronize
//! immediately instead of waiting out a stale IDLE timeout (spec §4.8).
//!
//! Detection compares monotonic elapsed time against wall-clock elapsed
//! time between ticks: a monotonic clock keeps running during suspend on
//! most platforms, wall clock does not advance while frozen, so a jump
//! where wall-clock time elapses far less than expected signals a resume.
//! wrenmail ticks every second and treats any gap larger than the
//! configured threshold as a resume.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::warn;

pub struct SleepDetectorConfig {
    pub tick: Duration,
    pub threshold: Duration,
}

impl Default for SleepDetectorConfig {
    fn default() -> Self {
        SleepDetectorConfig { tick: Duration::from_secs(1), threshold: Duration::from_secs(10) }
    }
}

/// Spawns the watchdog task. Returns a receiver that yields once per
/// detected resume-from-sleep event; the caller (the controller) wires this
/// into `ImapManagerHandle::force_wakeup`.
pub fn spawn(config: SleepDetectorConfig) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut ticker = interval(config.tick);
        let mut last = Instant::now();
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let elapsed = now.duration_since(last);
            if elapsed > config.tick + config.threshold {
                warn!(elapsed_secs = elapsed.as_secs(), "detected resume from sleep, forcing reconnect");
                if tx.send(()).is_err() {
                    return;
                }
            }
            last = now;
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_past_threshold_is_flagged() {
        let config = SleepDetectorConfig { tick: Duration::from_millis(10), threshold: Duration::from_millis(5) };
        let last = Instant::now();
        std::thread::sleep(Duration::from_millis(50));
        let elapsed = Instant::now().duration_since(last);
        assert!(elapsed > config.tick + config.threshold);
    }

    #[test]
    fn normal_tick_is_not_flagged() {
        let config = SleepDetectorConfig::default();
        let elapsed = Duration::from_millis(1100);
        assert!(elapsed <= config.tick + config.threshold);
    }
}
