// Flush worker - drains the disk queue into the sidecar
//
// One worker per proxy instance. It wakes on a stop signal, the periodic
// flush tick, or a queue notification, and then drains the queue batch by
// batch. Each batch is removed only after the sidecar accepted it; failures
// schedule exponential backoff and leave the batch in place for retry.

use crate::proxy::client::IngestClient;
use crate::queue::DiskQueue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Exponential backoff gate. Starts disengaged; each failure doubles the
/// delay up to the cap; one fully successful drain resets it.
#[derive(Debug, Default)]
pub struct Backoff {
    delay: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an attempt is allowed right now.
    pub fn ready(&self) -> bool {
        match self.next_attempt {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    pub fn record_failure(&mut self) {
        self.delay = if self.delay.is_zero() {
            BACKOFF_INITIAL
        } else {
            (self.delay * 2).min(BACKOFF_MAX)
        };
        self.next_attempt = Some(Instant::now() + self.delay);
        tracing::debug!("flush backoff: next attempt in {:?}", self.delay);
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
        self.next_attempt = None;
    }

    #[cfg(test)]
    fn current_delay(&self) -> Duration {
        self.delay
    }
}

pub struct FlushWorker {
    queue: Arc<DiskQueue>,
    client: IngestClient,
    flush_interval: Duration,
    batch_size: usize,
}

impl FlushWorker {
    pub fn new(
        queue: Arc<DiskQueue>,
        client: IngestClient,
        flush_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            client,
            flush_interval,
            batch_size,
        }
    }

    /// Run until the stop channel fires. Holds no locks across await points;
    /// it contends with request handlers only inside the queue itself.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = Backoff::new();

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    tracing::debug!("flush worker stopping");
                    return;
                }
                _ = ticker.tick() => {}
                _ = self.queue.notified() => {}
            }

            if !backoff.ready() {
                continue;
            }
            self.drain(&mut backoff).await;
        }
    }

    /// Drain the queue until it is empty or a step fails. The queue advances
    /// only after a successful flush, so a failure retries the whole batch.
    async fn drain(&self, backoff: &mut Backoff) {
        loop {
            let batch = match self.queue.fetch_batch(self.batch_size).await {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!("fetch batch failed: {}", err);
                    backoff.record_failure();
                    return;
                }
            };
            let Some(last) = batch.last() else {
                backoff.reset();
                return;
            };
            let last_id = last.id;

            let events = batch.into_iter().map(|entry| entry.event).collect();
            if let Err(err) = self.client.stream_events(events).await {
                tracing::warn!("event flush failed: {}", err);
                backoff.record_failure();
                return;
            }

            if let Err(err) = self.queue.delete_up_to(last_id).await {
                tracing::warn!("advance queue failed: {}", err);
                backoff.record_failure();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_starts_ready() {
        let backoff = Backoff::new();
        assert!(backoff.ready());
        assert_eq!(backoff.current_delay(), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        let expected = [
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(10),
            Duration::from_secs(10),
        ];
        for want in expected {
            backoff.record_failure();
            assert_eq!(backoff.current_delay(), want);
        }
    }

    #[test]
    fn test_backoff_gates_until_deadline() {
        let mut backoff = Backoff::new();
        backoff.record_failure();
        assert!(!backoff.ready());
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new();
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert!(backoff.ready());
        assert_eq!(backoff.current_delay(), Duration::ZERO);
        // The next failure starts from the initial delay again.
        backoff.record_failure();
        assert_eq!(backoff.current_delay(), Duration::from_millis(500));
    }
}
