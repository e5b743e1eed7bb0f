use crate::metrics::KindMetrics;
use prometheus_client::metrics::counter::Counter;
use std::{fmt, future::Future};
use tokio::{sync::watch, time};

/// Keeps exactly one instance of a task running, relaunching it whenever it terminates.
///
/// The supervised task is spawned and its join handle awaited, so a task that errors, returns,
/// or panics is replaced by a fresh one after a backoff. A new task is never launched before
/// the previous one has completed. Supervision ends only when the drain signal fires, at which
/// point the live task is aborted.
pub struct Watchdog {
    name: &'static str,
    backoff: Backoff,
    restarts: Counter,
    state: watch::Sender<State>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// The `generation`th task is live.
    Running { generation: u64 },

    /// The `generation`th task terminated; a replacement is launched once the backoff elapses.
    Restarting { generation: u64, failures: u32 },

    /// Supervision ended on shutdown.
    Stopped,
}

/// Capped exponential backoff between relaunches.
///
/// The first relaunch waits `min`, doubling with each consecutive failure up to `max`. A task
/// that stayed up for at least `healthy_after` resets the sequence.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub min: time::Duration,
    pub max: time::Duration,
    pub healthy_after: time::Duration,
}

// === impl Watchdog ===

impl Watchdog {
    pub fn new(name: &'static str, backoff: Backoff, metrics: &KindMetrics) -> Self {
        let (state, _) = watch::channel(State::Running { generation: 0 });
        Self {
            name,
            backoff,
            restarts: metrics.restarts.clone(),
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub async fn supervise<F, Fut, E>(self, mut launch: F, drain: drain::Watch)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let Self {
            name,
            backoff,
            restarts,
            state,
        } = self;

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        let mut generation = 0;
        let mut failures = 0;
        loop {
            generation += 1;
            let started = time::Instant::now();
            let mut task = tokio::spawn(launch());
            state.send_replace(State::Running { generation });
            tracing::debug!(name, generation, "Launched");

            let result = tokio::select! {
                result = &mut task => result,
                release = &mut shutdown => {
                    task.abort();
                    let _ = release.release_after(task).await;
                    state.send_replace(State::Stopped);
                    tracing::debug!(name, generation, "Stopped");
                    return;
                }
            };

            match result {
                Ok(Ok(())) => tracing::warn!(name, generation, "Terminated"),
                Ok(Err(error)) => tracing::warn!(name, generation, %error, "Failed"),
                Err(error) => tracing::error!(name, generation, %error, "Panicked"),
            }
            restarts.inc();

            if started.elapsed() >= backoff.healthy_after {
                failures = 0;
            }
            failures += 1;
            state.send_replace(State::Restarting {
                generation,
                failures,
            });

            let delay = backoff.delay(failures);
            tracing::info!(name, failures, ?delay, "Restarting");
            tokio::select! {
                _ = time::sleep(delay) => {}
                release = &mut shutdown => {
                    drop(release);
                    state.send_replace(State::Stopped);
                    return;
                }
            }
        }
    }
}

// === impl State ===

impl State {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { generation } if *generation > 0)
    }
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: time::Duration::from_millis(100),
            max: time::Duration::from_secs(30),
            healthy_after: time::Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Returns the delay before relaunching after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> time::Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.min.saturating_mul(1 << exp).min(self.max)
    }
}
