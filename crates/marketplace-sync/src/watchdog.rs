// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Liveness watchdog for the backend connection.
//!
//! The watchdog is armed when it starts and re-armed by every heartbeat. If
//! the window elapses without one, `on_stalled` runs exactly once; only a new
//! heartbeat can arm it again.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

use crate::task::ScheduledTask;

pub fn spawn_watchdog<F>(
    timeout: Duration,
    mut heartbeats: watch::Receiver<u64>,
    on_stalled: F,
) -> ScheduledTask
where
    F: Fn() + Send + 'static,
{
    ScheduledTask::spawn("watchdog", move |token| async move {
        let mut deadline = Instant::now() + timeout;
        let mut last_beat = Instant::now();
        let mut armed = true;
        let mut signal_open = true;
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                changed = heartbeats.changed(), if signal_open => match changed {
                    Ok(()) => {
                        heartbeats.borrow_and_update();
                        let now = Instant::now();
                        debug!(
                            since_last_ms = now.duration_since(last_beat).as_millis() as u64,
                            "marketplace-sync: backend heartbeat"
                        );
                        last_beat = now;
                        deadline = now + timeout;
                        armed = true;
                    }
                    Err(_) => {
                        // The transport went away; let the pending deadline decide.
                        signal_open = false;
                    }
                },
                () = sleep_until(deadline), if armed => {
                    armed = false;
                    error!(
                        timeout_ms = timeout.as_millis() as u64,
                        "marketplace-sync: no backend heartbeat within watchdog window"
                    );
                    on_stalled();
                }
            }
        }
    })
}
