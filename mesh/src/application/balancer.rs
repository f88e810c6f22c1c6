// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Task assignment across eligible agents.
//!
//! The balancer owns every [`Task`] it has seen: it is the only
//! writer of task status, which is what makes the least-loaded count
//! ("Running tasks assigned by this balancer") well defined.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentId, AgentRecord, AgentStatus};
use crate::domain::error::MeshError;
use crate::domain::task::{Task, TaskId, TaskStatus};

/// Load-balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    RoundRobin,
    Random,
    LeastLoaded,
    Weighted,
    PerformanceBased,
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::LeastLoaded => "least_loaded",
            Strategy::Weighted => "weighted",
            Strategy::PerformanceBased => "performance_based",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "round-robin" | "rr" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "least_loaded" | "least-loaded" | "ll" => Ok(Strategy::LeastLoaded),
            "weighted" => Ok(Strategy::Weighted),
            "performance_based" | "performance-based" | "perf" => Ok(Strategy::PerformanceBased),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Per-agent counters exposed by `lb stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentLoadStats {
    pub assigned_total: u64,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    /// Completion success rate, 1.0 with no history yet.
    pub performance_score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyStats {
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LbStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub per_agent: HashMap<String, AgentLoadStats>,
    pub per_strategy: HashMap<String, StrategyStats>,
}

/// Tasks pulled back or abandoned when an agent died.
#[derive(Debug, Default)]
pub struct RequeueOutcome {
    /// `(task, new attempt_count)` pairs, back to `Pending`.
    pub requeued: Vec<(TaskId, u32)>,
    /// Exceeded `max_attempts`; now terminal `Failed`.
    pub failed: Vec<(TaskId, u32)>,
}

#[derive(Default)]
struct BalancerInner {
    tasks: HashMap<TaskId, Task>,
    /// Per-capability round-robin cursor (also breaks least-loaded ties).
    cursors: HashMap<String, usize>,
    assigned_total: HashMap<AgentId, u64>,
    /// Assigned-or-Running tasks per agent.
    active: HashMap<AgentId, usize>,
    /// Terminal outcomes per agent, feeding the performance score.
    completed: HashMap<AgentId, u64>,
    failed: HashMap<AgentId, u64>,
    strategy_outcomes: HashMap<&'static str, StrategyStats>,
}

impl BalancerInner {
    /// Success rate of tasks the agent has finished; an agent with no
    /// history scores 1.0 so newcomers are not starved.
    fn performance_score(&self, agent_id: &AgentId) -> f64 {
        let completed = self.completed.get(agent_id).copied().unwrap_or(0);
        let failed = self.failed.get(agent_id).copied().unwrap_or(0);
        let total = completed + failed;
        if total == 0 {
            1.0
        } else {
            completed as f64 / total as f64
        }
    }
}

pub struct LoadBalancer {
    inner: Mutex<BalancerInner>,
    max_attempts: u32,
}

impl LoadBalancer {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(BalancerInner::default()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Accept a task. A task id already known is left untouched, so a
    /// resubmission cannot reset attempt counting.
    pub fn submit(&self, task: Task) {
        let mut inner = self.inner.lock();
        inner.tasks.entry(task.id.clone()).or_insert(task);
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.inner.lock().tasks.get(id).cloned()
    }

    pub fn pending(&self) -> Vec<Task> {
        let inner = self.inner.lock();
        inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect()
    }

    /// Pick one agent from `candidates` for the task and mark it
    /// `Assigned`. Candidates that are no longer `Active` are skipped
    /// regardless of strategy. With no usable candidate the task stays
    /// `Pending` and the call fails with `NoAvailableAgent`, to be
    /// retried on the next scheduling pass.
    ///
    /// `weights` only matters to [`Strategy::Weighted`]; an agent
    /// missing from the map weighs 1.0.
    pub fn assign(
        &self,
        task_id: &TaskId,
        candidates: &[AgentRecord],
        strategy: Strategy,
        weights: Option<&HashMap<String, f64>>,
    ) -> Result<AgentRecord, MeshError> {
        let mut inner = self.inner.lock();

        let task = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(MeshError::TaskTerminal(task_id.to_string()));
        }
        let capability = task.required_capability.clone();

        let live: Vec<&AgentRecord> = candidates
            .iter()
            .filter(|c| c.status == AgentStatus::Active)
            .collect();
        if live.is_empty() {
            inner
                .strategy_outcomes
                .entry(strategy.name())
                .or_default()
                .failure += 1;
            warn!(task_id = %task_id, strategy = %strategy, "no available agent");
            return Err(MeshError::NoAvailableAgent { capability });
        }

        let chosen = match strategy {
            Strategy::RoundRobin => {
                let cursor = inner.cursors.entry(capability.clone()).or_insert(0);
                let pick = *cursor % live.len();
                *cursor += 1;
                live[pick].clone()
            }
            Strategy::Random => {
                let pick = rand::thread_rng().gen_range(0..live.len());
                live[pick].clone()
            }
            Strategy::LeastLoaded => {
                let min_load = live
                    .iter()
                    .map(|c| inner.active.get(&c.id).copied().unwrap_or(0))
                    .min()
                    .unwrap_or(0);
                let tied: Vec<&AgentRecord> = live
                    .iter()
                    .copied()
                    .filter(|c| inner.active.get(&c.id).copied().unwrap_or(0) == min_load)
                    .collect();
                // Rotate through tied agents with the same cursor the
                // round-robin strategy uses.
                let cursor = inner.cursors.entry(capability.clone()).or_insert(0);
                let pick = *cursor % tied.len();
                *cursor += 1;
                tied[pick].clone()
            }
            Strategy::Weighted => {
                let weight_of = |c: &AgentRecord| {
                    weights
                        .and_then(|w| w.get(c.id.as_str()))
                        .copied()
                        .unwrap_or(1.0)
                        .max(0.0)
                };
                let total: f64 = live.iter().map(|c| weight_of(c)).sum();
                if total <= f64::EPSILON {
                    // Every candidate weighted out; fall back to the
                    // first rather than refuse the task.
                    live[0].clone()
                } else {
                    let mut point = rand::thread_rng().gen_range(0.0..total);
                    let mut chosen = live[live.len() - 1];
                    for &c in &live {
                        point -= weight_of(c);
                        if point < 0.0 {
                            chosen = c;
                            break;
                        }
                    }
                    chosen.clone()
                }
            }
            Strategy::PerformanceBased => {
                // Success rate discounted by current load; earlier
                // registration wins ties.
                let score_of = |c: &AgentRecord| {
                    let active = inner.active.get(&c.id).copied().unwrap_or(0);
                    inner.performance_score(&c.id) * (1.0 - active as f64 / 10.0)
                };
                let mut best = live[0];
                let mut best_score = score_of(best);
                for &c in live.iter().skip(1) {
                    let score = score_of(c);
                    if score > best_score {
                        best = c;
                        best_score = score;
                    }
                }
                best.clone()
            }
        };

        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.status = TaskStatus::Assigned;
            task.assigned_agent_id = Some(chosen.id.clone());
        }

        *inner.assigned_total.entry(chosen.id.clone()).or_default() += 1;
        *inner.active.entry(chosen.id.clone()).or_default() += 1;
        inner
            .strategy_outcomes
            .entry(strategy.name())
            .or_default()
            .success += 1;

        info!(task_id = %task_id, agent_id = %chosen.id, strategy = %strategy, "task assigned");
        Ok(chosen)
    }

    /// Transition `Assigned -> Running` when the agent starts work.
    pub fn mark_running(&self, task_id: &TaskId) -> Result<(), MeshError> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        match task.status {
            TaskStatus::Assigned => {
                task.status = TaskStatus::Running;
                Ok(())
            }
            TaskStatus::Running => Ok(()),
            _ => Err(MeshError::TaskTerminal(task_id.to_string())),
        }
    }

    /// Finish a task. Terminal states are immutable, so finishing an
    /// already-completed task is an error.
    pub fn complete(&self, task_id: &TaskId, success: bool) -> Result<TaskStatus, MeshError> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(MeshError::TaskTerminal(task_id.to_string()));
        }

        let status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        task.status = status;
        let agent = task.assigned_agent_id.clone();

        if let Some(agent) = agent {
            if let Some(active) = inner.active.get_mut(&agent) {
                *active = active.saturating_sub(1);
            }
            if success {
                *inner.completed.entry(agent).or_default() += 1;
            } else {
                *inner.failed.entry(agent).or_default() += 1;
            }
        }
        debug!(task_id = %task_id, %status, "task finished");
        Ok(status)
    }

    /// Pull back one task after a failed dispatch. Consumes an
    /// attempt like [`LoadBalancer::requeue_for_agent`] does.
    pub fn requeue_task(&self, task_id: &TaskId) -> Result<(TaskStatus, u32), MeshError> {
        let mut inner = self.inner.lock();
        let max_attempts = self.max_attempts;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(MeshError::TaskTerminal(task_id.to_string()));
        }
        let agent = task.assigned_agent_id.take();
        task.attempt_count += 1;
        task.status = if task.attempt_count >= max_attempts {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };
        let result = (task.status, task.attempt_count);
        if let Some(agent) = agent {
            if let Some(active) = inner.active.get_mut(&agent) {
                *active = active.saturating_sub(1);
            }
        }
        Ok(result)
    }

    /// Pull back every non-terminal task assigned to a dead agent.
    /// Each pulled task consumes one attempt; a task over the attempt
    /// budget becomes `Failed` instead of `Pending` and is reported,
    /// never silently dropped.
    pub fn requeue_for_agent(&self, agent_id: &AgentId) -> RequeueOutcome {
        let mut inner = self.inner.lock();
        let mut outcome = RequeueOutcome::default();

        let affected: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| {
                t.assigned_agent_id.as_ref() == Some(agent_id)
                    && matches!(t.status, TaskStatus::Assigned | TaskStatus::Running)
            })
            .map(|t| t.id.clone())
            .collect();

        for task_id in affected {
            let max_attempts = self.max_attempts;
            let Some(task) = inner.tasks.get_mut(&task_id) else {
                continue;
            };
            task.attempt_count += 1;
            task.assigned_agent_id = None;
            if task.attempt_count >= max_attempts {
                task.status = TaskStatus::Failed;
                warn!(task_id = %task_id, attempts = task.attempt_count, "task failed permanently");
                outcome.failed.push((task_id, task.attempt_count));
            } else {
                task.status = TaskStatus::Pending;
                info!(task_id = %task_id, attempts = task.attempt_count, "task requeued");
                outcome.requeued.push((task_id, task.attempt_count));
            }
        }

        if let Some(active) = inner.active.get_mut(agent_id) {
            *active = 0;
        }
        outcome
    }

    pub fn stats(&self) -> LbStats {
        let inner = self.inner.lock();
        let mut stats = LbStats {
            pending: 0,
            active: 0,
            completed: 0,
            failed: 0,
            per_agent: HashMap::new(),
            per_strategy: inner
                .strategy_outcomes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        };
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned | TaskStatus::Running => stats.active += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        for (agent, total) in &inner.assigned_total {
            stats.per_agent.insert(
                agent.to_string(),
                AgentLoadStats {
                    assigned_total: *total,
                    active: inner.active.get(agent).copied().unwrap_or(0),
                    completed: inner.completed.get(agent).copied().unwrap_or(0),
                    failed: inner.failed.get(agent).copied().unwrap_or(0),
                    performance_score: inner.performance_score(agent),
                },
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agents(n: usize) -> Vec<AgentRecord> {
        (0..n)
            .map(|i| AgentRecord::new(format!("agent-{i}"), "127.0.0.1", 7600 + i as u16, []))
            .collect()
    }

    fn submit(lb: &LoadBalancer, id: &str) -> TaskId {
        let task_id = TaskId::from(id);
        lb.submit(Task::new(task_id.clone(), "search", json!({})));
        task_id
    }

    #[test]
    fn round_robin_is_fair_over_three_agents() {
        let lb = LoadBalancer::new(3);
        let candidates = agents(3);
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut order = Vec::new();

        for i in 0..9 {
            let task_id = submit(&lb, &format!("t{i}"));
            let chosen = lb
                .assign(&task_id, &candidates, Strategy::RoundRobin, None)
                .unwrap();
            *counts.entry(chosen.id.to_string()).or_default() += 1;
            order.push(chosen.id.to_string());
        }

        assert!(counts.values().all(|&c| c == 3));
        // Registration order, repeating.
        assert_eq!(order[0..3], order[3..6]);
        assert_eq!(
            order[0..3],
            ["agent-0".to_string(), "agent-1".into(), "agent-2".into()]
        );
    }

    #[test]
    fn round_robin_skips_non_active_candidates() {
        let lb = LoadBalancer::new(3);
        let mut candidates = agents(3);
        candidates[1].status = AgentStatus::Suspect;

        for i in 0..4 {
            let task_id = submit(&lb, &format!("t{i}"));
            let chosen = lb
                .assign(&task_id, &candidates, Strategy::RoundRobin, None)
                .unwrap();
            assert_ne!(chosen.id.as_str(), "agent-1");
        }
    }

    #[test]
    fn least_loaded_prefers_idle_agent() {
        let lb = LoadBalancer::new(3);
        let candidates = agents(2);

        // Pin two tasks on agent picked first, then least-loaded must
        // choose the other.
        let t0 = submit(&lb, "t0");
        let first = lb.assign(&t0, &candidates, Strategy::LeastLoaded, None).unwrap();
        let t1 = submit(&lb, "t1");
        let second = lb.assign(&t1, &candidates, Strategy::LeastLoaded, None).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn weighted_never_picks_zero_weight_agent() {
        let lb = LoadBalancer::new(3);
        let candidates = agents(2);
        let weights = HashMap::from([("agent-0".to_string(), 0.0)]);

        for i in 0..20 {
            let task_id = submit(&lb, &format!("t{i}"));
            let chosen = lb
                .assign(&task_id, &candidates, Strategy::Weighted, Some(&weights))
                .unwrap();
            assert_eq!(chosen.id.as_str(), "agent-1");
        }
    }

    #[test]
    fn performance_based_prefers_successful_agent() {
        let lb = LoadBalancer::new(3);
        let candidates = agents(2);

        // Pin one task per agent, then fail agent-0's and complete
        // agent-1's. Their scores diverge to 0.0 and 1.0.
        let t0 = submit(&lb, "t0");
        lb.assign(&t0, &candidates, Strategy::RoundRobin, None).unwrap();
        let t1 = submit(&lb, "t1");
        lb.assign(&t1, &candidates, Strategy::RoundRobin, None).unwrap();
        lb.complete(&t0, false).unwrap();
        lb.complete(&t1, true).unwrap();

        let t2 = submit(&lb, "t2");
        let chosen = lb
            .assign(&t2, &candidates, Strategy::PerformanceBased, None)
            .unwrap();
        assert_eq!(chosen.id.as_str(), "agent-1");

        let stats = lb.stats();
        assert_eq!(stats.per_agent["agent-0"].performance_score, 0.0);
        assert_eq!(stats.per_agent["agent-1"].performance_score, 1.0);
    }

    #[test]
    fn empty_candidates_leave_task_pending() {
        let lb = LoadBalancer::new(3);
        let task_id = submit(&lb, "t0");
        let err = lb.assign(&task_id, &[], Strategy::Random, None).unwrap_err();
        assert!(matches!(err, MeshError::NoAvailableAgent { .. }));
        assert_eq!(lb.get(&task_id).unwrap().status, TaskStatus::Pending);
        assert_eq!(lb.stats().per_strategy["random"].failure, 1);
    }

    #[test]
    fn requeue_increments_attempts_and_fails_over_budget() {
        let lb = LoadBalancer::new(2);
        let candidates = agents(1);
        let task_id = submit(&lb, "t0");

        lb.assign(&task_id, &candidates, Strategy::RoundRobin, None).unwrap();
        lb.mark_running(&task_id).unwrap();
        let outcome = lb.requeue_for_agent(&candidates[0].id);
        assert_eq!(outcome.requeued, vec![(task_id.clone(), 1)]);
        assert_eq!(lb.get(&task_id).unwrap().status, TaskStatus::Pending);

        lb.assign(&task_id, &candidates, Strategy::RoundRobin, None).unwrap();
        let outcome = lb.requeue_for_agent(&candidates[0].id);
        assert_eq!(outcome.failed, vec![(task_id.clone(), 2)]);
        assert_eq!(lb.get(&task_id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn terminal_tasks_are_immutable() {
        let lb = LoadBalancer::new(3);
        let candidates = agents(1);
        let task_id = submit(&lb, "t0");
        lb.assign(&task_id, &candidates, Strategy::RoundRobin, None).unwrap();
        lb.complete(&task_id, true).unwrap();

        assert!(matches!(
            lb.complete(&task_id, false).unwrap_err(),
            MeshError::TaskTerminal(_)
        ));
        assert!(matches!(
            lb.assign(&task_id, &candidates, Strategy::RoundRobin, None).unwrap_err(),
            MeshError::TaskTerminal(_)
        ));
    }
}
