//! Periodic liveness message while connected.

use depot_core::catalog::unix_now;
use depot_core::{Outbound, Outbox};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

pub struct Heartbeat {
    period: Duration,
    outbox: Outbox,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(period: Duration, outbox: Outbox) -> Self {
        Self {
            period,
            outbox,
            task: None,
        }
    }

    /// Start ticking. The first heartbeat goes out one period from now.
    pub fn start(&mut self) {
        self.stop();
        let period = self.period;
        let outbox = self.outbox.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("Heartbeat");
                outbox.post(Outbound::heartbeat(unix_now()));
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::outbox;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_each_period() {
        let (outbox, mut rx) = outbox::channel(8);
        let mut heartbeat = Heartbeat::new(Duration::from_secs(30), outbox);
        heartbeat.start();
        assert!(heartbeat.is_running());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(rx.try_recv(), Ok(Outbound::Heartbeat { .. })));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(matches!(rx.try_recv(), Ok(Outbound::Heartbeat { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_silences() {
        let (outbox, mut rx) = outbox::channel(8);
        let mut heartbeat = Heartbeat::new(Duration::from_secs(5), outbox);
        heartbeat.start();
        heartbeat.stop();
        assert!(!heartbeat.is_running());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_double_up() {
        let (outbox, mut rx) = outbox::channel(8);
        let mut heartbeat = Heartbeat::new(Duration::from_secs(5), outbox);
        heartbeat.start();
        heartbeat.start();

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
