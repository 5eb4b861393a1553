use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

/// Owned handle to a spawned timer task. The timer posts its payload back
/// into the owner's command queue, so whatever fires always acts on current
/// state rather than a snapshot captured at registration time. Dropping or
/// canceling the handle aborts the task; a timer never outlives its owner.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn once<T: Send + 'static>(delay: Duration, tx: mpsc::Sender<T>, value: T) -> Self {
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(value).await;
        });
        Self { task }
    }

    pub fn every<T: Clone + Send + 'static>(
        period: Duration,
        tx: mpsc::Sender<T>,
        value: T,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if tx.send(value.clone()).await.is_err() {
                    break;
                }
            }
        });
        Self { task }
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
