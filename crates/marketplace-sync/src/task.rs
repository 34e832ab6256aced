// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cancellable background tasks.
//!
//! A [`ScheduledTask`] pairs a spawned task with a cancellation token.
//! [`ScheduledTask::cancel`] signals the token and then awaits the task, so
//! a timer body that already fired finishes before its owner tears down the
//! state it touches.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Spawns `body` with a token it is expected to observe.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(token.clone()));
        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Runs `body` once after `delay` unless cancelled first.
    pub fn after<F, Fut>(name: &'static str, delay: Duration, body: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, move |token| async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!(task = name, "marketplace-sync: timer cancelled before firing");
                }
                () = sleep(delay) => body().await,
            }
        })
    }

    /// Runs `body` every `period`, first after one full period.
    pub fn every<F>(name: &'static str, period: Duration, body: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        Self::spawn(name, move |token| async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => body(),
                }
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Cancels the task and waits until its body has returned.
    ///
    /// Must not be called from inside the task itself.
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    warn!(task = self.name, "marketplace-sync: background task panicked");
                }
            }
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn after_fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let task = ScheduledTask::after("test", Duration::from_secs(5), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_firing_skips_body() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let task = ScheduledTask::after("test", Duration::from_secs(5), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel().await;
        sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_waits_for_running_body() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let task = ScheduledTask::after("test", Duration::from_secs(1), move || async move {
            sleep(Duration::from_secs(3)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });
        // Let the timer fire so the body is mid-flight.
        sleep(Duration::from_millis(1500)).await;
        task.cancel().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = ScheduledTask::every("test", Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        task.cancel().await;
        sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
