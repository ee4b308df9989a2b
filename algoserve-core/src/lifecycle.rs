//! Server lifecycle state machine.
//!
//! The server moves through `initialized → provisioning → ready → running →
//! draining → stopped`, with `failed` as the error sink. Components attach
//! async hooks to transitions — the executor's `start()` runs on `ready`,
//! its drain on `draining` — and the HTTP readiness probe reports ready
//! only while the state is `ready` or `running`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

/// The server-wide phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Initialized,
    Provisioning,
    Ready,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// Whether the readiness probe should pass in this state.
    pub fn is_ready(self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Running)
    }

    /// Whether the server may still accept work at all (requests arriving
    /// while draining are shed by the executor, not the transport).
    pub fn accepts_requests(self) -> bool {
        matches!(
            self,
            LifecycleState::Ready | LifecycleState::Running | LifecycleState::Draining
        )
    }

    fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        // Anything may fail; nothing leaves the terminal states.
        if to == Failed {
            return !matches!(self, Stopped | Failed);
        }
        matches!(
            (self, to),
            (Initialized, Provisioning)
                | (Provisioning, Ready)
                | (Ready, Running)
                | (Ready, Draining)
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Initialized => "initialized",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Error type for lifecycle operations.
#[derive(Debug)]
pub enum LifecycleError {
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    Hook {
        state: LifecycleState,
        message: String,
    },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::IllegalTransition { from, to } => {
                write!(f, "illegal lifecycle transition {from} -> {to}")
            }
            LifecycleError::Hook { state, message } => {
                write!(f, "lifecycle hook failed entering {state}: {message}")
            }
        }
    }
}

impl std::error::Error for LifecycleError {}

type HookFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

struct Inner {
    state: watch::Sender<LifecycleState>,
    hooks: Mutex<HashMap<LifecycleState, Vec<Hook>>>,
}

/// Cloneable handle to the lifecycle machine.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Initialized);
        Self {
            inner: Arc::new(Inner {
                state,
                hooks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn current(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Watch state changes without holding the machine.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Attach a hook to run when the machine *enters* `state`. Hooks run in
    /// registration order, before the new state becomes observable.
    pub fn on_enter<F, Fut>(&self, state: LifecycleState, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let boxed: Hook = Box::new(move || Box::pin(hook()) as HookFuture);
        self.inner
            .hooks
            .lock()
            .expect("lifecycle hooks lock poisoned")
            .entry(state)
            .or_default()
            .push(boxed);
    }

    /// Drive the machine to `to`, running that state's hooks first.
    ///
    /// A hook failure sends the machine to `failed` and returns the error.
    pub async fn advance(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        let from = self.current();
        if !from.can_transition_to(to) {
            return Err(LifecycleError::IllegalTransition { from, to });
        }

        let hooks = self
            .inner
            .hooks
            .lock()
            .expect("lifecycle hooks lock poisoned")
            .remove(&to)
            .unwrap_or_default();
        for hook in hooks {
            if let Err(message) = hook().await {
                error!(state = %to, %message, "lifecycle hook failed");
                self.inner.state.send_replace(LifecycleState::Failed);
                return Err(LifecycleError::Hook { state: to, message });
            }
        }

        info!(from = %from, to = %to, "lifecycle transition");
        self.inner.state.send_replace(to);
        Ok(())
    }

    /// Send the machine straight to `failed` (startup errors).
    pub fn fail(&self) {
        self.inner.state.send_replace(LifecycleState::Failed);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle").field("state", &self.current()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn happy_path_transitions() {
        let lc = Lifecycle::new();
        assert_eq!(lc.current(), LifecycleState::Initialized);
        lc.advance(LifecycleState::Provisioning).await.unwrap();
        lc.advance(LifecycleState::Ready).await.unwrap();
        assert!(lc.current().is_ready());
        lc.advance(LifecycleState::Running).await.unwrap();
        lc.advance(LifecycleState::Draining).await.unwrap();
        assert!(!lc.current().is_ready());
        lc.advance(LifecycleState::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn illegal_transition_fails_fast() {
        let lc = Lifecycle::new();
        let err = lc.advance(LifecycleState::Running).await.unwrap_err();
        assert!(matches!(err, LifecycleError::IllegalTransition { .. }));
        // State unchanged after the refused transition.
        assert_eq!(lc.current(), LifecycleState::Initialized);
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let lc = Lifecycle::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["pool", "catalog"] {
            let order = order.clone();
            lc.on_enter(LifecycleState::Ready, move || async move {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }
        lc.advance(LifecycleState::Provisioning).await.unwrap();
        lc.advance(LifecycleState::Ready).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["pool", "catalog"]);
    }

    #[tokio::test]
    async fn failing_hook_sinks_to_failed() {
        let lc = Lifecycle::new();
        lc.on_enter(LifecycleState::Ready, || async {
            Err("no workers".to_string())
        });
        lc.advance(LifecycleState::Provisioning).await.unwrap();
        let err = lc.advance(LifecycleState::Ready).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Hook { .. }));
        assert_eq!(lc.current(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn watchers_observe_transitions() {
        let lc = Lifecycle::new();
        let mut rx = lc.subscribe();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_task = seen.clone();
        let watcher = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                seen_task.fetch_add(1, Ordering::SeqCst);
                if rx.borrow().is_ready() {
                    break;
                }
            }
        });
        lc.advance(LifecycleState::Provisioning).await.unwrap();
        lc.advance(LifecycleState::Ready).await.unwrap();
        watcher.await.unwrap();
        assert!(seen.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn terminal_states_do_not_fail() {
        assert!(!LifecycleState::Stopped.can_transition_to(LifecycleState::Failed));
        assert!(!LifecycleState::Failed.can_transition_to(LifecycleState::Provisioning));
    }
}
