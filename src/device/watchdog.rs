use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

/// Periodic liveness timer owned by a single device
#[derive(Default)]
pub struct WatchdogService {
    task: Option<JoinHandle<()>>,
}

impl WatchdogService {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Calls `callback` every `period`, a running timer is replaced
    pub fn start<F>(&mut self, period: Duration, mut callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.stop();

        debug!("Starting watchdog with period {:?}", period);
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip first immediate tick

            loop {
                interval.tick().await;
                callback();
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Stopping watchdog");
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for WatchdogService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let mut watchdog = WatchdogService::new();
        watchdog.start(Duration::from_secs(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(watchdog.is_running());

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        watchdog.stop();
        assert!(!watchdog.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
