//! Generic liveness monitor
//!
//! Probes on an interval and arms a timeout after each probe. Any call
//! to [`Heartbeat::resolve`] counts as liveness and disarms the pending
//! timeout; if the timeout elapses first the failure callback runs once
//! and probing stops. The owner decides what failure means.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatOptions {
    pub enabled: bool,
    /// Time between probes
    pub interval: Duration,
    /// How long to wait for liveness after each probe
    pub timeout: Duration,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct Heartbeat {
    liveness_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Start probing. `on_probe` fires every interval; `on_timeout` fires
    /// at most once, if no liveness arrives within the timeout window.
    pub fn start<P, T>(interval: Duration, timeout: Duration, on_probe: P, on_timeout: T) -> Self
    where
        P: Fn() + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        let (liveness_tx, mut liveness_rx) = mpsc::channel::<()>(16);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately

            loop {
                ticker.tick().await;

                // Liveness observed between probes has already satisfied
                // us; drain it so it cannot answer for the next probe.
                while liveness_rx.try_recv().is_ok() {}

                on_probe();

                match tokio::time::timeout(timeout, liveness_rx.recv()).await {
                    Ok(Some(())) => trace!("heartbeat liveness confirmed"),
                    Ok(None) => break, // handle dropped, monitor stopped
                    Err(_) => {
                        on_timeout();
                        break;
                    }
                }
            }
        });

        Self {
            liveness_tx,
            task: Some(task),
        }
    }

    /// Record liveness, disarming the currently armed timeout if any
    pub fn resolve(&self) {
        let _ = self.liveness_tx.try_send(());
    }

    /// Cancel interval and pending timeout. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_fires_each_interval_when_resolved() {
        let (probes, timeouts) = counters();
        let (p, t) = (probes.clone(), timeouts.clone());

        let hb = Heartbeat::start(
            Duration::from_secs(30),
            Duration::from_secs(10),
            move || {
                p.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(31)).await;
            hb.resolve();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert_eq!(probes.load(Ordering::SeqCst), 3);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_without_liveness() {
        let (probes, timeouts) = counters();
        let (p, t) = (probes.clone(), timeouts.clone());

        let _hb = Heartbeat::start(
            Duration::from_secs(30),
            Duration::from_secs(10),
            move || {
                p.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Long enough for several intervals; probing must stop after the
        // first missed timeout.
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_liveness_does_not_satisfy_next_probe() {
        let (probes, timeouts) = counters();
        let (p, t) = (probes.clone(), timeouts.clone());

        let hb = Heartbeat::start(
            Duration::from_secs(30),
            Duration::from_secs(10),
            move || {
                p.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );

        // First round: answer the probe, then pile up stale liveness
        // before the second probe arms.
        tokio::time::sleep(Duration::from_secs(31)).await;
        hb.resolve();
        tokio::time::sleep(Duration::from_secs(1)).await;
        hb.resolve();
        hb.resolve();

        // Second round: no fresh liveness after the probe.
        tokio::time::sleep(Duration::from_secs(45)).await;

        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_suppresses_timeout() {
        let (probes, timeouts) = counters();
        let (p, t) = (probes.clone(), timeouts.clone());

        let mut hb = Heartbeat::start(
            Duration::from_secs(30),
            Duration::from_secs(10),
            move || {
                p.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        hb.stop();
        hb.stop();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }
}
