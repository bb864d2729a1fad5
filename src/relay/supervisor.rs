//! Supervision of relay subscriptions.
//!
//! The [`Supervisor`] is a plain state machine with the states
//! [`SupervisorState::Subscribed`], [`SupervisorState::Restarting`] and
//! [`SupervisorState::Stopped`]:
//!
//! | from         | event                 | to           | wait before next attempt |
//! |--------------|-----------------------|--------------|--------------------------|
//! | `Restarting` | `RestartDue`          | `Subscribed` |                          |
//! | `Subscribed` | `SubscriptionEnded`   | `Restarting` | restart delay            |
//! | `Subscribed` | `SubscriptionFailed`  | `Restarting` | error backoff            |
//! | `Stopped`    | `StartRequested`      | `Restarting` | none                     |
//! | any          | `StopRequested`       | `Stopped`    |                          |
//!
//! Every other combination leaves the state unchanged. [`RelayHandle`] runs
//! the machine on a spawned task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;
use crate::relay::{CycleOutcome, Subscription};

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Subscribed,
    Restarting,
    Stopped,
}

/// Input of the supervisor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    RestartDue,
    SubscriptionEnded,
    SubscriptionFailed,
    StartRequested,
    StopRequested,
}

/// Restart state machine of one relay.
#[derive(Debug, Clone)]
pub struct Supervisor {
    state: SupervisorState,
    consecutive_failures: u32,
    policy: ReconnectPolicy,
}

impl Supervisor {
    /// A stopped supervisor.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: SupervisorState::Stopped,
            consecutive_failures: 0,
            policy,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Apply `event`. Returns how long to wait before the next subscription
    /// attempt when the machine entered `Restarting`.
    pub fn transition(&mut self, event: SupervisorEvent) -> Option<Duration> {
        use SupervisorEvent::*;
        use SupervisorState::*;

        match (self.state, event) {
            (_, StopRequested) => {
                self.state = Stopped;
                None
            }
            (Restarting, RestartDue) => {
                self.state = Subscribed;
                None
            }
            (Subscribed, SubscriptionEnded) => {
                self.state = Restarting;
                self.consecutive_failures = 0;
                Some(self.policy.restart_delay)
            }
            (Subscribed, SubscriptionFailed) => {
                self.state = Restarting;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                Some(self.policy.error_delay(self.consecutive_failures))
            }
            (Stopped, StartRequested) => {
                self.state = Restarting;
                self.consecutive_failures = 0;
                Some(Duration::ZERO)
            }
            _ => None,
        }
    }
}

/// Control handle of a running relay.
///
/// Dropping the handle does not stop the relay; call [`RelayHandle::stop`].
#[derive(Clone)]
pub struct RelayHandle {
    inner: Arc<Inner>,
}

struct Inner {
    subscription: Arc<dyn Subscription>,
    policy: ReconnectPolicy,
    state: watch::Sender<SupervisorState>,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Start supervising `subscription` on the current tokio runtime.
    pub fn start(subscription: Arc<dyn Subscription>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        let handle = Self {
            inner: Arc::new(Inner {
                subscription,
                policy,
                state,
                running: Mutex::new(None),
            }),
        };
        handle.start_if_stopped();
        handle
    }

    /// Current supervisor state, for health checks.
    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Subscribe to supervisor state changes.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    /// Resume the relay if it was stopped. Does nothing when it is running.
    pub fn start_if_stopped(&self) -> bool {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            self.inner.subscription.clone(),
            Supervisor::new(self.inner.policy),
            self.inner.state.clone(),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });
        true
    }

    /// Stop the relay and wait for the current handler to settle.
    ///
    /// No further events are pulled afterwards. Stopping twice is a no-op.
    pub async fn stop(&self) {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            if let Err(error) = task.await {
                tracing::error!(?error, "Relay task failed");
            }
        }
        self.inner.state.send_replace(SupervisorState::Stopped);
    }
}

#[tracing::instrument(skip_all)]
async fn supervise(
    subscription: Arc<dyn Subscription>,
    mut supervisor: Supervisor,
    state: watch::Sender<SupervisorState>,
    cancel: CancellationToken,
) {
    let hook = subscription.hook();
    hook.on_startup();

    let mut delay = supervisor
        .transition(SupervisorEvent::StartRequested)
        .unwrap_or_default();
    state.send_replace(supervisor.state());

    loop {
        if !delay.is_zero() {
            hook.on_restart_scheduled(delay);
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        supervisor.transition(SupervisorEvent::RestartDue);
        state.send_replace(supervisor.state());

        let event = match subscription.run_cycle(cancel.clone()).await {
            Ok(CycleOutcome::Cancelled) => break,
            Ok(CycleOutcome::Ended { .. }) => SupervisorEvent::SubscriptionEnded,
            Err(err) => {
                hook.on_subscription_error(&err);
                SupervisorEvent::SubscriptionFailed
            }
        };
        if cancel.is_cancelled() {
            break;
        }
        delay = supervisor.transition(event).unwrap_or_default();
        state.send_replace(supervisor.state());
    }

    supervisor.transition(SupervisorEvent::StopRequested);
    state.send_replace(supervisor.state());
    hook.on_shutdown();
}
