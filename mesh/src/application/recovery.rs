// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault detection and recovery.
//!
//! Two pieces: a per-agent circuit breaker set consulted before
//! dispatching work, and the [`FaultMonitor`] sweep that walks agent
//! health transitions, pulls tasks back from dead agents, and emits
//! [`MeshEvent`]s for anything watching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::application::balancer::LoadBalancer;
use crate::application::registry::AgentRegistry;
use crate::application::state_store::StateStore;
use crate::domain::agent::AgentId;
use crate::domain::config::MeshConfig;
use crate::domain::events::MeshEvent;

/// Successful probes needed to close a half-open circuit.
const HALF_OPEN_SUCCESSES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls are refused until the reset window elapses.
    Open,
    /// One probe stream allowed; failures reopen immediately.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
        }
    }
}

/// One circuit breaker per remote agent.
pub struct CircuitBreakerSet {
    breakers: Mutex<HashMap<AgentId, Breaker>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerSet {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    /// Whether a call to `agent` may proceed. An open circuit past
    /// its reset window half-opens and admits the caller as a probe.
    pub fn allow(&self, agent: &AgentId) -> bool {
        self.allow_at(agent, Instant::now())
    }

    fn allow_at(&self, agent: &AgentId, now: Instant) -> bool {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(agent.clone()).or_insert_with(Breaker::new);
        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.reset_timeout {
                    debug!(agent_id = %agent, "circuit half-open");
                    breaker.state = CircuitState::HalfOpen;
                    breaker.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, agent: &AgentId) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(agent.clone()).or_insert_with(Breaker::new);
        breaker.consecutive_failures = 0;
        if breaker.state == CircuitState::HalfOpen {
            breaker.half_open_successes += 1;
            if breaker.half_open_successes >= HALF_OPEN_SUCCESSES {
                info!(agent_id = %agent, "circuit closed");
                *breaker = Breaker::new();
            }
        }
    }

    pub fn record_failure(&self, agent: &AgentId) {
        self.record_failure_at(agent, Instant::now())
    }

    fn record_failure_at(&self, agent: &AgentId, now: Instant) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(agent.clone()).or_insert_with(Breaker::new);
        breaker.consecutive_failures += 1;
        let trip = breaker.state == CircuitState::HalfOpen
            || breaker.consecutive_failures >= self.failure_threshold;
        if trip && breaker.state != CircuitState::Open {
            warn!(agent_id = %agent, failures = breaker.consecutive_failures, "circuit opened");
        }
        if trip {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(now);
            breaker.half_open_successes = 0;
        }
    }

    pub fn state(&self, agent: &AgentId) -> CircuitState {
        self.breakers
            .lock()
            .get(agent)
            .map_or(CircuitState::Closed, |b| b.state)
    }

    /// Drop the breaker for an evicted agent.
    pub fn forget(&self, agent: &AgentId) {
        self.breakers.lock().remove(agent);
    }

    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .lock()
            .iter()
            .map(|(id, b)| (id.to_string(), b.state))
            .collect()
    }
}

/// Periodic sweep driving agent health transitions and task recovery.
pub struct FaultMonitor {
    registry: Arc<AgentRegistry>,
    balancer: Arc<LoadBalancer>,
    state: Arc<StateStore>,
    breakers: Arc<CircuitBreakerSet>,
    events: broadcast::Sender<MeshEvent>,
    local: AgentId,
    suspect_after: Duration,
    dead_after: Duration,
    retention: Duration,
    tombstone_retention: Duration,
}

impl FaultMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        balancer: Arc<LoadBalancer>,
        state: Arc<StateStore>,
        breakers: Arc<CircuitBreakerSet>,
        events: broadcast::Sender<MeshEvent>,
        config: &MeshConfig,
    ) -> Self {
        Self {
            registry,
            balancer,
            state,
            breakers,
            events,
            local: AgentId::from(config.agent_id.as_str()),
            suspect_after: config.suspect_threshold(),
            dead_after: config.dead_threshold(),
            retention: config.dead_retention(),
            tombstone_retention: config.tombstone_retention(),
        }
    }

    /// One sweep pass at `now`. Split out from the timer loop so
    /// tests can drive it deterministically.
    pub fn run_once(&self, now: chrono::DateTime<Utc>) {
        // This process is alive by definition; keep its own record
        // fresh so the sweep only judges remote agents.
        let _ = self.registry.heartbeat(&self.local);

        let outcome = self
            .registry
            .sweep(now, self.suspect_after, self.dead_after, self.retention);

        for agent_id in outcome.suspected {
            warn!(%agent_id, "agent suspected");
            self.emit(MeshEvent::AgentSuspected { agent_id });
        }

        for agent_id in outcome.died {
            warn!(%agent_id, "agent dead, recovering its tasks");
            let pulled = self.balancer.requeue_for_agent(&agent_id);
            for (task_id, attempt_count) in pulled.requeued {
                self.emit(MeshEvent::TaskRequeued {
                    task_id,
                    from_agent: agent_id.clone(),
                    attempt_count,
                });
            }
            for (task_id, attempt_count) in pulled.failed {
                self.emit(MeshEvent::TaskFailed {
                    task_id,
                    attempt_count,
                });
            }
            self.emit(MeshEvent::AgentDied { agent_id });
        }

        for agent_id in outcome.evicted {
            info!(%agent_id, "dead agent record evicted");
            self.breakers.forget(&agent_id);
            self.emit(MeshEvent::AgentEvicted { agent_id });
        }

        let purged = self.state.purge_tombstones(now, self.tombstone_retention);
        if purged > 0 {
            debug!(purged, "tombstones purged");
        }
    }

    fn emit(&self, event: MeshEvent) {
        // Nobody subscribed is fine.
        let _ = self.events.send(event);
    }

    /// Sweep on `interval` until the shutdown flag flips.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once(Utc::now()),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentStatus;
    use crate::domain::task::{Task, TaskId, TaskStatus};
    use serde_json::json;

    fn agent(id: &str) -> AgentId {
        AgentId::from(id)
    }

    #[test]
    fn breaker_opens_after_threshold_and_recovers_through_half_open() {
        let set = CircuitBreakerSet::new(5, Duration::from_secs(60));
        let id = agent("a1");
        let t0 = Instant::now();

        for _ in 0..4 {
            set.record_failure_at(&id, t0);
        }
        assert_eq!(set.state(&id), CircuitState::Closed);
        set.record_failure_at(&id, t0);
        assert_eq!(set.state(&id), CircuitState::Open);
        assert!(!set.allow_at(&id, t0 + Duration::from_secs(59)));

        // Reset window elapsed: the next caller is the probe.
        assert!(set.allow_at(&id, t0 + Duration::from_secs(60)));
        assert_eq!(set.state(&id), CircuitState::HalfOpen);

        set.record_success(&id);
        set.record_success(&id);
        assert_eq!(set.state(&id), CircuitState::HalfOpen);
        set.record_success(&id);
        assert_eq!(set.state(&id), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let set = CircuitBreakerSet::new(5, Duration::from_secs(60));
        let id = agent("a1");
        let t0 = Instant::now();
        for _ in 0..5 {
            set.record_failure_at(&id, t0);
        }
        assert!(set.allow_at(&id, t0 + Duration::from_secs(61)));
        set.record_failure_at(&id, t0 + Duration::from_secs(61));
        assert_eq!(set.state(&id), CircuitState::Open);
        assert!(!set.allow_at(&id, t0 + Duration::from_secs(62)));
    }

    #[test]
    fn success_resets_failure_streak() {
        let set = CircuitBreakerSet::new(3, Duration::from_secs(60));
        let id = agent("a1");
        set.record_failure(&id);
        set.record_failure(&id);
        set.record_success(&id);
        set.record_failure(&id);
        set.record_failure(&id);
        assert_eq!(set.state(&id), CircuitState::Closed);
    }

    fn monitor_fixture() -> (
        Arc<AgentRegistry>,
        Arc<LoadBalancer>,
        FaultMonitor,
        broadcast::Receiver<MeshEvent>,
    ) {
        let config = MeshConfig::new("local", "127.0.0.1:0");
        let registry = Arc::new(AgentRegistry::new());
        let balancer = Arc::new(LoadBalancer::new(config.max_attempts));
        let state = Arc::new(StateStore::new("local"));
        let breakers = Arc::new(CircuitBreakerSet::new(
            config.failure_threshold,
            config.breaker_reset(),
        ));
        let (tx, rx) = broadcast::channel(64);
        let monitor = FaultMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&balancer),
            state,
            breakers,
            tx,
            &config,
        );
        (registry, balancer, monitor, rx)
    }

    #[test]
    fn dead_agent_tasks_are_requeued_and_events_emitted() {
        let (registry, balancer, monitor, mut rx) = monitor_fixture();
        registry.register(crate::domain::agent::AgentRecord::new(
            "a1",
            "127.0.0.1",
            7601,
            ["search".to_string()],
        ));

        let task_id = TaskId::from("t0");
        balancer.submit(Task::new(task_id.clone(), "search", json!({})));
        let candidates = registry.list(Some("search"));
        balancer
            .assign(&task_id, &candidates, crate::application::balancer::Strategy::RoundRobin, None)
            .unwrap();

        // Drive the record to Suspect, then Dead, with two passes.
        let t0 = registry.get(&AgentId::from("a1")).unwrap().last_heartbeat;
        monitor.run_once(t0 + chrono::Duration::seconds(31));
        assert_eq!(
            registry.get(&AgentId::from("a1")).unwrap().status,
            AgentStatus::Suspect
        );
        monitor.run_once(t0 + chrono::Duration::seconds(95));
        assert_eq!(
            registry.get(&AgentId::from("a1")).unwrap().status,
            AgentStatus::Dead
        );

        assert_eq!(balancer.get(&task_id).unwrap().status, TaskStatus::Pending);
        assert_eq!(balancer.get(&task_id).unwrap().attempt_count, 1);

        let mut saw_requeue = false;
        let mut saw_death = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                MeshEvent::TaskRequeued { task_id: t, .. } => {
                    assert_eq!(t, task_id);
                    saw_requeue = true;
                }
                MeshEvent::AgentDied { agent_id } => {
                    assert_eq!(agent_id, AgentId::from("a1"));
                    saw_death = true;
                }
                _ => {}
            }
        }
        assert!(saw_requeue && saw_death);
    }
}
