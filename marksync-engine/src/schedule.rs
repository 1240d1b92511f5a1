//! When the next sync runs.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub trait Scheduler: Send + Sync {
    /// Run a sync once `delay` has passed, replacing whatever was scheduled.
    fn schedule(&self, delay: Duration);
}

/// A single re-armable alarm that repeats every `period` after firing.
pub struct AlarmScheduler {
    period: Duration,
    deadline: Mutex<Instant>,
    rearmed: Notify,
}

impl AlarmScheduler {
    pub fn new(period: Duration, first_delay: Duration) -> Self {
        AlarmScheduler {
            period,
            deadline: Mutex::new(Instant::now() + first_delay),
            rearmed: Notify::new(),
        }
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().expect("mutex poisoned")
    }

    /// Wait for the alarm to fire, then arm it again for one period later.
    pub async fn tick(&self) {
        loop {
            let deadline = self.deadline();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let mut current = self.deadline.lock().expect("mutex poisoned");
                    if *current == deadline {
                        *current = Instant::now() + self.period;
                        return;
                    }
                }
                _ = self.rearmed.notified() => {}
            }
        }
    }
}

impl Scheduler for AlarmScheduler {
    fn schedule(&self, delay: Duration) {
        *self.deadline.lock().expect("mutex poisoned") = Instant::now() + delay;
        self.rearmed.notify_one();
    }
}

/// Remembers what was scheduled without acting on it.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<Duration>>,
}

impl RecordingScheduler {
    pub fn scheduled(&self) -> Vec<Duration> {
        self.scheduled.lock().expect("mutex poisoned").clone()
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, delay: Duration) {
        self.scheduled.lock().expect("mutex poisoned").push(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_first_delay_then_periodically() {
        let start = Instant::now();
        let alarm = AlarmScheduler::new(10 * MINUTE, MINUTE);
        alarm.tick().await;
        assert_eq!(start.elapsed(), MINUTE);
        alarm.tick().await;
        assert_eq!(start.elapsed(), 11 * MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_replaces_pending_alarm() {
        let start = Instant::now();
        let alarm = Arc::new(AlarmScheduler::new(10 * MINUTE, 10 * MINUTE));
        let waiter = tokio::spawn({
            let alarm = alarm.clone();
            async move { alarm.tick().await }
        });
        tokio::time::sleep(MINUTE).await;
        alarm.schedule(MINUTE);
        waiter.await.unwrap();
        assert_eq!(start.elapsed(), 2 * MINUTE);
        assert_eq!(alarm.deadline(), start + 12 * MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_before_tick() {
        let start = Instant::now();
        let alarm = AlarmScheduler::new(10 * MINUTE, 10 * MINUTE);
        alarm.schedule(Duration::from_secs(5));
        alarm.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_recording_scheduler() {
        let scheduler = RecordingScheduler::default();
        scheduler.schedule(MINUTE);
        assert_eq!(scheduler.scheduled(), vec![MINUTE]);
    }
}
