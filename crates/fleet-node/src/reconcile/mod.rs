//! Reconciler: converges the supervisor's tunnels to the desired set
//!
//! A pass snapshots desired and observed state, plans actions, and runs them
//! with bounded concurrency. Actions for one tunnel never overlap; actions for
//! different tunnels run in parallel. Observed state is written only here.

pub mod locks;
pub mod plan;

pub use locks::TunnelLocks;
pub use plan::{plan, Action, RetryPolicy};

use crate::desired::DesiredStore;
use crate::supervisor::{Supervisor, SupervisorError};
use chrono::Utc;
use fleet_proto::{TunnelSpec, TunnelState, TunnelStatus};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Periodic pass interval when nothing wakes the reconciler
    pub interval: Duration,
    /// Supervisor operations allowed in flight at once
    pub max_concurrent_ops: usize,
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_concurrent_ops: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Observed tunnel states at the generation they were reconciled against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub generation: u64,
    pub tunnels: Vec<TunnelState>,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    supervisor: Arc<Supervisor>,
    desired: Arc<DesiredStore>,
    observed: Mutex<BTreeMap<String, TunnelState>>,
    locks: TunnelLocks,
    pass: Mutex<()>,
    wake: Notify,
    report_tx: watch::Sender<StatusReport>,
    shutting_down: AtomicBool,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        supervisor: Arc<Supervisor>,
        desired: Arc<DesiredStore>,
    ) -> Self {
        let (report_tx, _) = watch::channel(StatusReport::default());
        Self {
            config,
            supervisor,
            desired,
            observed: Mutex::new(BTreeMap::new()),
            locks: TunnelLocks::new(),
            pass: Mutex::new(()),
            wake: Notify::new(),
            report_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn desired(&self) -> &Arc<DesiredStore> {
        &self.desired
    }

    /// Request a pass as soon as possible
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Status reports, updated after every pass that changed something
    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.report_tx.subscribe()
    }

    /// Observed states right now
    pub async fn snapshot(&self) -> Vec<TunnelState> {
        self.observed.lock().await.values().cloned().collect()
    }

    /// Adopt forwarders left running by a previous node process
    pub async fn recover(&self) -> Result<usize, SupervisorError> {
        let states = self.supervisor.recover().await?;
        let count = states.len();

        let mut observed = self.observed.lock().await;
        for state in states {
            observed.insert(state.tunnel_id.clone(), state);
        }
        drop(observed);

        if count > 0 {
            info!(count, "Recovered running tunnels");
        }
        self.publish().await;
        Ok(count)
    }

    /// Run one reconciliation pass and publish the result
    pub async fn run_pass(self: &Arc<Self>) -> StatusReport {
        let _pass = self.pass.lock().await;
        let desired = self.desired.snapshot();

        self.sync_observed(&desired.tunnels).await;

        let actions = {
            let observed = self.observed.lock().await;
            plan(&desired.tunnels, &observed, &self.config.retry, Utc::now())
        };

        if !actions.is_empty() {
            debug!(
                generation = desired.generation,
                actions = actions.len(),
                "Reconciling tunnels"
            );
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_ops.max(1)));
            let mut tasks = JoinSet::new();
            for action in actions {
                let this = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    this.execute(action).await;
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Reconcile task failed");
                }
            }
            self.locks.prune();
        }

        self.publish().await
    }

    /// Reconcile on every wake-up or interval until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_concurrent_ops = self.config.max_concurrent_ops,
            "Reconciler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_pass().await;
            let delay = self.next_delay().await;

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.shutting_down.store(true, Ordering::SeqCst);
        info!("Reconciler stopped");
    }

    /// Stop starting new actions; in-flight ones finish
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    async fn execute(&self, action: Action) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let _guard = self.locks.lock(action.tunnel_id()).await;
        match action {
            Action::Apply(spec) => self.apply(spec).await,
            Action::Teardown(tunnel_id) => self.teardown(&tunnel_id).await,
        }
    }

    async fn apply(&self, spec: TunnelSpec) {
        let previous = self.observed.lock().await.get(&spec.tunnel_id).cloned();
        let (applied_version, attempts) = match &previous {
            Some(state)
                if state.target_version == spec.version && state.status == TunnelStatus::Failed =>
            {
                (state.applied_version, state.attempts)
            }
            Some(state) => (state.applied_version, 0),
            None => (0, 0),
        };

        // Visible while the supervisor works, startup grace included
        let mut pending = TunnelState::pending(&spec);
        pending.applied_version = applied_version;
        pending.attempts = attempts;
        if let Some(prior) = &previous {
            pending.handle = prior.handle;
            pending.last_error = prior.last_error.clone();
        }
        self.observed
            .lock()
            .await
            .insert(spec.tunnel_id.clone(), pending);
        self.publish().await;

        let state = match self.supervisor.apply(&spec).await {
            Ok(state) => {
                let already_up = previous
                    .as_ref()
                    .is_some_and(|p| p.is_active() && p.applied_version == spec.version);
                if !already_up {
                    info!(
                        tunnel_id = %spec.tunnel_id,
                        version = spec.version,
                        local_port = spec.local_port,
                        remote_target = %spec.remote_target,
                        "Tunnel active"
                    );
                }
                state
            }
            Err(e) => self.failed_state(&spec, applied_version, attempts, &e),
        };

        self.observed
            .lock()
            .await
            .insert(spec.tunnel_id.clone(), state);
    }

    fn failed_state(
        &self,
        spec: &TunnelSpec,
        applied_version: u64,
        attempts: u32,
        error: &SupervisorError,
    ) -> TunnelState {
        let budget = self.config.retry.budget;
        let mut state = TunnelState::pending(spec);
        state.applied_version = applied_version;
        state.status = TunnelStatus::Failed;
        state.last_error = Some(error.to_string());
        state.attempts = if error.is_permanent() {
            budget.max(attempts + 1)
        } else if error.consumes_budget() {
            attempts + 1
        } else {
            attempts
        };
        state.retry_exhausted = state.attempts >= budget;

        if state.retry_exhausted {
            error!(
                tunnel_id = %spec.tunnel_id,
                version = spec.version,
                attempts = state.attempts,
                error = %error,
                "Tunnel failed, retry budget exhausted"
            );
        } else {
            warn!(
                tunnel_id = %spec.tunnel_id,
                version = spec.version,
                attempts = state.attempts,
                error = %error,
                "Tunnel apply failed"
            );
        }
        state
    }

    async fn teardown(&self, tunnel_id: &str) {
        let result = self.supervisor.teardown(tunnel_id).await;

        let mut observed = self.observed.lock().await;
        let Some(state) = observed.get_mut(tunnel_id) else {
            return;
        };
        state.handle = None;
        state.updated_at = Utc::now();
        match result {
            Ok(()) => {
                info!(tunnel_id = %tunnel_id, "Tunnel stopped");
                state.status = TunnelStatus::Stopped;
                state.last_error = None;
            }
            Err(e) => {
                error!(tunnel_id = %tunnel_id, error = %e, "Tunnel teardown failed");
                state.status = TunnelStatus::Failed;
                state.last_error = Some(e.to_string());
            }
        }
    }

    /// Fold the supervisor's view into observed state: crashed forwarders
    /// become failures, forwarders we didn't know about get tracked, and
    /// stopped tunnels the panel has forgotten are dropped.
    async fn sync_observed(&self, desired: &BTreeMap<String, TunnelSpec>) {
        let listed = self.supervisor.list().await;
        let budget = self.config.retry.budget;
        let mut observed = self.observed.lock().await;

        // Stopped states were reported by the previous pass
        observed.retain(|tunnel_id, state| {
            state.status != TunnelStatus::Stopped
                || desired.get(tunnel_id).is_some_and(|spec| spec.enabled)
        });

        for current in listed {
            let Some(held) = observed.get_mut(&current.tunnel_id) else {
                observed.insert(current.tunnel_id.clone(), current);
                continue;
            };

            if held.is_active() && current.status == TunnelStatus::Failed {
                held.status = TunnelStatus::Failed;
                held.handle = None;
                held.last_error = current.last_error;
                held.attempts += 1;
                held.retry_exhausted = held.attempts >= budget;
                held.updated_at = Utc::now();
                warn!(
                    tunnel_id = %held.tunnel_id,
                    error = held.last_error.as_deref().unwrap_or("unknown"),
                    "Forwarder died"
                );
            }
        }
    }

    /// Sleep until the earliest pending retry, bounded by the pass interval
    async fn next_delay(&self) -> Duration {
        let now = Utc::now();
        let policy = &self.config.retry;
        let observed = self.observed.lock().await;

        observed
            .values()
            .filter(|s| {
                s.status == TunnelStatus::Failed && !s.retry_exhausted && s.attempts < policy.budget
            })
            .map(|s| {
                let due = s.updated_at
                    + chrono::Duration::from_std(policy.backoff(s.attempts))
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                (due - now).to_std().unwrap_or(Duration::ZERO)
            })
            .fold(self.config.interval, Duration::min)
    }

    async fn publish(&self) -> StatusReport {
        let report = StatusReport {
            generation: self.desired.generation(),
            tunnels: self.observed.lock().await.values().cloned().collect(),
        };
        self.report_tx.send_if_modified(|current| {
            if *current == report {
                false
            } else {
                *current = report.clone();
                true
            }
        });
        report
    }
}
