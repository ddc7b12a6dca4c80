//! Pure planning: desired specs + observed states -> actions

use chrono::{DateTime, Utc};
use fleet_proto::{TunnelSpec, TunnelState, TunnelStatus};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Apply(TunnelSpec),
    Teardown(String),
}

impl Action {
    pub fn tunnel_id(&self) -> &str {
        match self {
            Action::Apply(spec) => &spec.tunnel_id,
            Action::Teardown(tunnel_id) => tunnel_id,
        }
    }
}

/// Retry budget and exponential backoff for failed applies
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub budget: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try after `attempts` failures (`base * 2^(attempts-1)`)
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    fn retry_due(&self, state: &TunnelState, now: DateTime<Utc>) -> bool {
        let wait = chrono::Duration::from_std(self.backoff(state.attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now >= state.updated_at + wait
    }
}

/// Decide what to do for every tunnel. Sorted by tunnel id, at most one
/// action per tunnel.
pub fn plan(
    desired: &BTreeMap<String, TunnelSpec>,
    observed: &BTreeMap<String, TunnelState>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Vec<Action> {
    let mut actions = Vec::new();

    for (tunnel_id, spec) in desired.iter().filter(|(_, spec)| spec.enabled) {
        let Some(state) = observed.get(tunnel_id) else {
            actions.push(Action::Apply(spec.clone()));
            continue;
        };

        if spec.version > state.target_version {
            actions.push(Action::Apply(spec.clone()));
            continue;
        }
        if spec.version < state.target_version {
            // Held state is ahead of this spec; the desired store never goes backwards
            continue;
        }

        let apply = match state.status {
            TunnelStatus::Active => false,
            TunnelStatus::Pending | TunnelStatus::Stopped => true,
            TunnelStatus::Failed => {
                !state.retry_exhausted
                    && state.attempts < policy.budget
                    && policy.retry_due(state, now)
            }
        };
        if apply {
            actions.push(Action::Apply(spec.clone()));
        }
    }

    for (tunnel_id, state) in observed {
        let wanted = desired.get(tunnel_id).is_some_and(|spec| spec.enabled);
        if !wanted && state.status != TunnelStatus::Stopped {
            actions.push(Action::Teardown(tunnel_id.clone()));
        }
    }

    actions.sort_by(|a, b| a.tunnel_id().cmp(b.tunnel_id()));
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_proto::{ProtocolMode, TunnelHandle};

    fn spec(tunnel_id: &str, version: u64, enabled: bool) -> TunnelSpec {
        TunnelSpec {
            tunnel_id: tunnel_id.to_string(),
            node_id: "node-a".to_string(),
            local_port: 9000,
            remote_target: "10.0.0.1:80".to_string(),
            mode: ProtocolMode::Tcp,
            enabled,
            version,
        }
    }

    fn desired(specs: Vec<TunnelSpec>) -> BTreeMap<String, TunnelSpec> {
        specs
            .into_iter()
            .map(|s| (s.tunnel_id.clone(), s))
            .collect()
    }

    fn observed(states: Vec<TunnelState>) -> BTreeMap<String, TunnelState> {
        states
            .into_iter()
            .map(|s| (s.tunnel_id.clone(), s))
            .collect()
    }

    fn active(spec: &TunnelSpec) -> TunnelState {
        TunnelState::active(spec, TunnelHandle { pid: 42, local_port: spec.local_port })
    }

    fn failed(spec: &TunnelSpec, attempts: u32, at: DateTime<Utc>) -> TunnelState {
        let mut state = TunnelState::pending(spec);
        state.status = TunnelStatus::Failed;
        state.attempts = attempts;
        state.updated_at = at;
        state
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_new_spec_is_applied() {
        let now = Utc::now();
        let actions = plan(
            &desired(vec![spec("a", 1, true)]),
            &BTreeMap::new(),
            &RetryPolicy::default(),
            now,
        );
        assert_eq!(actions, vec![Action::Apply(spec("a", 1, true))]);
    }

    #[test]
    fn test_converged_state_plans_nothing() {
        let s = spec("a", 3, true);
        let actions = plan(
            &desired(vec![s.clone()]),
            &observed(vec![active(&s)]),
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn test_newer_version_replaces_active() {
        let old = spec("a", 3, true);
        let new = spec("a", 5, true);
        let actions = plan(
            &desired(vec![new.clone()]),
            &observed(vec![active(&old)]),
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert_eq!(actions, vec![Action::Apply(new)]);
    }

    #[test]
    fn test_failed_retries_after_backoff_within_budget() {
        let s = spec("a", 1, true);
        let policy = RetryPolicy::default();
        let now = Utc::now();

        // 2 failures -> 2s backoff
        let recent = observed(vec![failed(&s, 2, now - chrono::Duration::seconds(1))]);
        assert!(plan(&desired(vec![s.clone()]), &recent, &policy, now).is_empty());

        let due = observed(vec![failed(&s, 2, now - chrono::Duration::seconds(3))]);
        assert_eq!(
            plan(&desired(vec![s.clone()]), &due, &policy, now),
            vec![Action::Apply(s.clone())]
        );

        let spent = observed(vec![failed(&s, 5, now - chrono::Duration::hours(1))]);
        assert!(plan(&desired(vec![s.clone()]), &spent, &policy, now).is_empty());
    }

    #[test]
    fn test_exhausted_tunnel_resumes_on_new_version() {
        let s = spec("a", 1, true);
        let mut state = failed(&s, 5, Utc::now());
        state.retry_exhausted = true;

        let edited = spec("a", 2, true);
        let actions = plan(
            &desired(vec![edited.clone()]),
            &observed(vec![state]),
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert_eq!(actions, vec![Action::Apply(edited)]);
    }

    #[test]
    fn test_disabled_and_removed_specs_are_torn_down() {
        let kept = spec("a", 1, true);
        let disabled = spec("b", 2, false);
        let removed = spec("c", 1, true);

        let mut stopped = active(&spec("d", 1, true));
        stopped.status = TunnelStatus::Stopped;

        let actions = plan(
            &desired(vec![kept.clone(), disabled.clone()]),
            &observed(vec![
                active(&kept),
                active(&spec("b", 1, true)),
                active(&removed),
                stopped,
            ]),
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert_eq!(
            actions,
            vec![
                Action::Teardown("b".to_string()),
                Action::Teardown("c".to_string())
            ]
        );
    }

    #[test]
    fn test_stopped_state_with_enabled_spec_is_reapplied() {
        let s = spec("a", 1, true);
        let mut state = active(&s);
        state.status = TunnelStatus::Stopped;

        let actions = plan(
            &desired(vec![s.clone()]),
            &observed(vec![state]),
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert_eq!(actions, vec![Action::Apply(s)]);
    }
}
