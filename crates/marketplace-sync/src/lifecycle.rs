// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection lifecycle: authentication, retries, watchdog and token refresh.
//!
//! [`CredentialSession`] turns the refresh token into [`Credentials`] and a
//! [`ClientHandle`]. [`ConnectionLifecycleManager`] drives the
//! [`ConnectionState`] machine around it:
//!
//! ```text
//! Uninitialized ──initialize──> Initializing ──ok──> Ready ──watchdog──> Unhealthy
//!                                   │  ^
//!                          exchange │  │ retry delay
//!                            failed v  │
//!                               RetryingInit
//! ```
//!
//! The owner reacts to the lifecycle through [`LifecycleHooks`]; recovering
//! from `Unhealthy` or an expired token is always a `stop()` followed by a
//! fresh `initialize()`, usually scheduled through a [`RestartDebouncer`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::AuthError;
use crate::task::ScheduledTask;
use crate::transport::{Backend, ClientHandle, Credentials};
use crate::watchdog::spawn_watchdog;

/// State of the backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    /// Credentials and a client handle exist.
    Ready,
    /// The last exchange failed and a retry timer is pending.
    RetryingInit,
    /// The watchdog fired; the client handle is kept until the owner restarts.
    Unhealthy,
}

/// Callbacks the lifecycle manager fires towards its owner.
///
/// Hooks run on timer tasks and must return promptly: anything that awaits
/// the lifecycle manager (a restart in particular) has to be spawned.
pub trait LifecycleHooks: Send + Sync {
    /// Credentials and a client handle are available.
    fn on_ready(&self) {
        info!("marketplace-sync: client initialized");
    }

    /// No liveness signal arrived within the watchdog window.
    fn on_unhealthy(&self) {
        warn!("marketplace-sync: connection unhealthy and no owner hook installed");
    }

    /// The scheduled token lifetime elapsed.
    fn on_token_expired(&self) {
        warn!("marketplace-sync: token expired and no owner hook installed");
    }
}

/// Hook set that only logs.
#[derive(Debug, Default)]
pub struct LoggingHooks;

impl LifecycleHooks for LoggingHooks {}

/// Refresh-token based authentication against the backend.
pub struct CredentialSession {
    backend: Arc<dyn Backend>,
    credentials: Mutex<Option<Credentials>>,
}

impl std::fmt::Debug for CredentialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSession")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl CredentialSession {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            credentials: Mutex::new(None),
        }
    }

    /// Exchanges the refresh token, keeps the result and builds a client
    /// bound to it.
    pub async fn establish(&self) -> Result<ClientHandle, AuthError> {
        let client = self.exchange().await?;
        self.accept(&client.credentials);
        Ok(client)
    }

    /// Exchanges the refresh token without touching the session's credentials.
    async fn exchange(&self) -> Result<ClientHandle, AuthError> {
        let credentials = self.backend.exchange_token().await?;
        if credentials.user_id.is_empty() {
            return Err(AuthError::MissingField("user_id"));
        }
        if credentials.id_token.is_empty() {
            return Err(AuthError::MissingField("id_token"));
        }
        Ok(self.backend.connect(credentials))
    }

    fn accept(&self, credentials: &Credentials) {
        *lock(&self.credentials) = Some(credentials.clone());
    }

    pub fn credentials(&self) -> Option<Credentials> {
        lock(&self.credentials).clone()
    }

    pub fn user_id(&self) -> Option<String> {
        lock(&self.credentials)
            .as_ref()
            .map(|credentials| credentials.user_id.clone())
    }

    pub fn invalidate(&self) {
        lock(&self.credentials).take();
    }
}

enum AttemptOutcome {
    Installed,
    /// A concurrent initialisation or a `stop()` made this attempt moot.
    Superseded,
    Failed,
}

struct LifecycleState {
    status: ConnectionState,
    /// Bumped by `stop()`; attempts started under an older epoch are discarded.
    epoch: u64,
    client: Option<ClientHandle>,
    retry: Option<ScheduledTask>,
    watchdog: Option<ScheduledTask>,
    refresh: Option<ScheduledTask>,
}

struct LifecycleShared {
    session: CredentialSession,
    config: SyncConfig,
    hooks: Arc<dyn LifecycleHooks>,
    state: Mutex<LifecycleState>,
}

/// Owns the [`CredentialSession`] and every timer around it.
#[derive(Clone)]
pub struct ConnectionLifecycleManager {
    shared: Arc<LifecycleShared>,
}

impl std::fmt::Debug for ConnectionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLifecycleManager")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl ConnectionLifecycleManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: SyncConfig,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Self {
        let shared = LifecycleShared {
            session: CredentialSession::new(backend),
            config,
            hooks,
            state: Mutex::new(LifecycleState {
                status: ConnectionState::Uninitialized,
                epoch: 0,
                client: None,
                retry: None,
                watchdog: None,
                refresh: None,
            }),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.state).status
    }

    /// Client handle of the current session, if one was established.
    pub fn client(&self) -> Option<ClientHandle> {
        lock(&self.shared.state).client.clone()
    }

    pub fn session(&self) -> &CredentialSession {
        &self.shared.session
    }

    /// Establishes the session unless it already exists.
    ///
    /// With a client already in place this only re-fires `on_ready` (when
    /// `notify` is set). Exchange failures never surface to the caller: the
    /// manager moves to [`ConnectionState::RetryingInit`] and keeps a single
    /// retry timer until credentials can be obtained.
    pub async fn initialize(&self, notify: bool) {
        let epoch = {
            let mut state = lock(&self.shared.state);
            let status = state.status;
            match status {
                ConnectionState::Ready | ConnectionState::Unhealthy => {
                    drop(state);
                    if notify {
                        self.shared.hooks.on_ready();
                    }
                    return;
                }
                ConnectionState::RetryingInit if state.retry.is_some() => {
                    debug!("marketplace-sync: initialization retry already pending");
                    return;
                }
                _ => {}
            }
            state.status = ConnectionState::Initializing;
            state.epoch
        };

        debug!("marketplace-sync: initializing client");
        if let AttemptOutcome::Failed = self.shared.attempt(epoch, notify).await {
            self.shared.schedule_retry(epoch, notify);
        }
    }

    /// Cancels every timer, waits for running timer bodies, then releases the client.
    pub async fn stop(&self) {
        debug!("marketplace-sync: stopping client");
        let (tasks, client) = {
            let mut state = lock(&self.shared.state);
            state.epoch = state.epoch.wrapping_add(1);
            state.status = ConnectionState::Uninitialized;
            let tasks = [
                state.retry.take(),
                state.watchdog.take(),
                state.refresh.take(),
            ];
            (tasks, state.client.take())
        };
        for task in tasks.into_iter().flatten() {
            task.cancel().await;
        }
        self.shared.session.invalidate();
        if let Some(client) = client {
            client.transport.shutdown();
        }
    }

    pub async fn restart(&self) {
        debug!("marketplace-sync: restarting client");
        self.stop().await;
        self.initialize(true).await;
    }
}

impl LifecycleShared {
    async fn attempt(self: &Arc<Self>, epoch: u64, notify: bool) -> AttemptOutcome {
        match self.session.exchange().await {
            Ok(client) => self.install(epoch, client, notify),
            Err(err) => {
                warn!(%err, "marketplace-sync: failed to obtain credentials");
                AttemptOutcome::Failed
            }
        }
    }

    fn install(self: &Arc<Self>, epoch: u64, client: ClientHandle, notify: bool) -> AttemptOutcome {
        let mut state = lock(&self.state);
        if state.epoch != epoch || state.status == ConnectionState::Ready {
            debug!("marketplace-sync: discarding client from a superseded initialization");
            return AttemptOutcome::Superseded;
        }

        self.session.accept(&client.credentials);
        let heartbeats = client.transport.liveness().subscribe();
        state.client = Some(client);
        state.status = ConnectionState::Ready;
        // Dropping the slot only detaches the retry task; it exits right after installing.
        state.retry.take();

        let weak = Arc::downgrade(self);
        state.watchdog = Some(spawn_watchdog(
            self.config.watchdog_timeout,
            heartbeats,
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.mark_unhealthy(epoch);
                }
            },
        ));

        let weak = Arc::downgrade(self);
        state.refresh = Some(ScheduledTask::every(
            "token-refresh",
            self.config.token_refresh_interval,
            move || {
                if let Some(shared) = weak.upgrade() {
                    debug!("marketplace-sync: refreshing client token id");
                    shared.hooks.on_token_expired();
                }
            },
        ));
        drop(state);

        info!("marketplace-sync: client initialized");
        if notify {
            self.hooks.on_ready();
        }
        AttemptOutcome::Installed
    }

    fn mark_unhealthy(&self, epoch: u64) {
        {
            let mut state = lock(&self.state);
            if state.epoch != epoch {
                return;
            }
            state.status = ConnectionState::Unhealthy;
        }
        self.hooks.on_unhealthy();
    }

    fn schedule_retry(self: &Arc<Self>, epoch: u64, notify: bool) {
        let mut state = lock(&self.state);
        if state.epoch != epoch || state.status == ConnectionState::Ready || state.retry.is_some() {
            return;
        }
        state.status = ConnectionState::RetryingInit;
        let delay = self.config.init_retry_delay;
        let weak: Weak<LifecycleShared> = Arc::downgrade(self);
        debug!(
            delay_ms = delay.as_millis() as u64,
            "marketplace-sync: scheduling initialization retry"
        );
        state.retry = Some(ScheduledTask::spawn("init-retry", move |token| async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    () = sleep(delay) => {}
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                {
                    let mut state = lock(&shared.state);
                    if state.epoch != epoch {
                        return;
                    }
                    state.status = ConnectionState::Initializing;
                }
                warn!("marketplace-sync: retrying client initialization");
                let outcome = tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    outcome = shared.attempt(epoch, notify) => outcome,
                };
                match outcome {
                    AttemptOutcome::Installed | AttemptOutcome::Superseded => return,
                    AttemptOutcome::Failed => {
                        let mut state = lock(&shared.state);
                        if state.epoch != epoch {
                            return;
                        }
                        state.status = ConnectionState::RetryingInit;
                    }
                }
            }
        }));
    }
}

/// Boxed restart action run by a [`RestartDebouncer`].
pub type RestartFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartPhase {
    Idle,
    /// A restart is waiting out the delay.
    Waiting,
    /// The restart action is running; `again` records a request made meanwhile.
    Running { again: bool },
}

/// Coalesces bursts of restart requests into one delayed restart.
///
/// Requests made while a restart is waiting out the delay are merged into
/// it. Requests made while the action runs are merged into a single
/// follow-up restart, since the running one may already be past the state
/// that prompted them.
pub struct RestartDebouncer {
    delay: Duration,
    action: RestartFn,
    phase: Arc<Mutex<RestartPhase>>,
    closed: AtomicBool,
    task: Mutex<Option<ScheduledTask>>,
}

impl std::fmt::Debug for RestartDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartDebouncer")
            .field("delay", &self.delay)
            .field("phase", &*lock(&self.phase))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RestartDebouncer {
    pub fn new(delay: Duration, action: RestartFn) -> Self {
        Self {
            delay,
            action,
            phase: Arc::new(Mutex::new(RestartPhase::Idle)),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Requests a restart; returns whether a new one was scheduled.
    pub fn trigger(&self) -> bool {
        let mut task = lock(&self.task);
        if self.closed.load(Ordering::SeqCst) {
            debug!("marketplace-sync: restart requested after shutdown; ignoring");
            return false;
        }
        {
            let mut phase = lock(&self.phase);
            match *phase {
                RestartPhase::Waiting | RestartPhase::Running { again: true } => {
                    debug!("marketplace-sync: restart already scheduled; coalescing request");
                    return false;
                }
                RestartPhase::Running { again: false } => {
                    debug!("marketplace-sync: restart running; scheduling a follow-up");
                    *phase = RestartPhase::Running { again: true };
                    return true;
                }
                RestartPhase::Idle => *phase = RestartPhase::Waiting,
            }
        }
        let action = Arc::clone(&self.action);
        let phase = Arc::clone(&self.phase);
        let delay = self.delay;
        *task = Some(ScheduledTask::spawn("restart", move |token| async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    () = sleep(delay) => {}
                }
                *lock(&phase) = RestartPhase::Running { again: false };
                (action)().await;
                let again = {
                    let mut current = lock(&phase);
                    let again = *current == (RestartPhase::Running { again: true });
                    *current = if again {
                        RestartPhase::Waiting
                    } else {
                        RestartPhase::Idle
                    };
                    again
                };
                if !again {
                    return;
                }
            }
        }));
        true
    }

    pub fn is_pending(&self) -> bool {
        *lock(&self.phase) != RestartPhase::Idle
    }

    /// Refuses further requests, cancels a waiting restart and waits for a
    /// running one to finish.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.cancel().await;
        }
        *lock(&self.phase) = RestartPhase::Idle;
    }

    /// Accepts requests again after [`RestartDebouncer::close`].
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
