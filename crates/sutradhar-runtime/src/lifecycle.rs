use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sutradhar_types::{
    AgentStatus, BeatUpdate, HealReport, Heartbeat, KillResult, OrphanPolicy, SpawnCheck,
    StatusChange, SYSTEM_MAX_DEPTH, SYSTEM_MAX_FAN_OUT,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub heartbeat_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub dead_threshold_ms: u64,
    pub global_max_agents: usize,
    pub budget_decay_factor: f64,
    pub root_token_budget: u64,
    pub orphan_policy: OrphanPolicy,
    pub max_agent_depth: u32,
    pub max_sub_agents: usize,
    pub min_token_budget_for_spawn: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            stale_threshold_ms: 30_000,
            dead_threshold_ms: 120_000,
            global_max_agents: 50,
            budget_decay_factor: 0.5,
            root_token_budget: 1_000_000,
            orphan_policy: OrphanPolicy::default(),
            max_agent_depth: 5,
            max_sub_agents: 8,
            min_token_budget_for_spawn: 10_000,
        }
    }
}

type Observer = Arc<dyn Fn(&StatusChange) + Send + Sync>;

struct State {
    agents: HashMap<String, Heartbeat>,
    observers: Vec<(u64, Observer)>,
    next_observer_id: u64,
    disposed: bool,
}

struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Owns the agent map. All mutation goes through this API; readers get
/// clones. Status observers are notified after the lock is released, in
/// registration order, with panics swallowed.
pub struct LifecycleManager {
    config: LifecycleConfig,
    state: Mutex<State>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                agents: HashMap::new(),
                observers: Vec::new(),
                next_observer_id: 0,
                disposed: false,
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn effective_max_depth(&self) -> u32 {
        SYSTEM_MAX_DEPTH.min(self.config.max_agent_depth)
    }

    fn effective_max_fan_out(&self) -> usize {
        SYSTEM_MAX_FAN_OUT.min(self.config.max_sub_agents)
    }

    fn notify(observers: &[(u64, Observer)], changes: &[StatusChange]) {
        for change in changes {
            for (_, observer) in observers {
                if catch_unwind(AssertUnwindSafe(|| observer(change))).is_err() {
                    warn!(agent = %change.agent_id, "status observer panicked");
                }
            }
        }
    }

    fn transition(
        agents: &mut HashMap<String, Heartbeat>,
        changes: &mut Vec<StatusChange>,
        id: &str,
        new_status: AgentStatus,
    ) {
        if let Some(beat) = agents.get_mut(id) {
            if beat.status == new_status {
                return;
            }
            let old_status = beat.status;
            beat.status = new_status;
            beat.status_changed_at = Instant::now();
            changes.push(StatusChange {
                agent_id: beat.agent_id.clone(),
                old_status,
                new_status,
                parent_id: beat.parent_id.clone(),
            });
        }
    }

    /// Descendant ids of `root`, deepest first, `root` excluded.
    fn descendants_deepest_first(agents: &HashMap<String, Heartbeat>, root: &str) -> Vec<String> {
        let mut found: Vec<(u32, String)> = Vec::new();
        let mut frontier: Vec<String> = vec![root.to_string()];
        while let Some(current) = frontier.pop() {
            for beat in agents.values() {
                if beat.parent_id.as_deref() == Some(current.as_str()) {
                    found.push((beat.depth, beat.agent_id.clone()));
                    frontier.push(beat.agent_id.clone());
                }
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, id)| id).collect()
    }

    /// Is `candidate` an ancestor of `agent`? Linear in depth, bounded by
    /// the system ceiling.
    fn is_ancestor(agents: &HashMap<String, Heartbeat>, candidate: &str, agent: &str) -> bool {
        let mut current = agents.get(agent).and_then(|b| b.parent_id.clone());
        for _ in 0..=SYSTEM_MAX_DEPTH {
            match current {
                Some(id) if id == candidate => return true,
                Some(id) => current = agents.get(&id).and_then(|b| b.parent_id.clone()),
                None => return false,
            }
        }
        false
    }

    // ==========================================
    // Registration & heartbeats
    // ==========================================

    pub fn register_agent(&self, heartbeat: Heartbeat) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Err(Error::Disposed);
        }
        if state.agents.contains_key(&heartbeat.agent_id) {
            return Err(Error::AlreadyRegistered(heartbeat.agent_id));
        }
        if heartbeat.token_budget == 0 {
            return Err(Error::InvalidOperation(
                "token budget must be positive".to_string(),
            ));
        }
        debug!(agent = %heartbeat.agent_id, depth = heartbeat.depth, "agent registered");
        state.agents.insert(heartbeat.agent_id.clone(), heartbeat);
        Ok(())
    }

    /// Refresh an agent's heartbeat. A stale agent revives to alive.
    /// Unknown ids return false.
    pub fn record_heartbeat(&self, id: &str, update: BeatUpdate) -> bool {
        let (known, changes, observers) = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return false;
            }
            let mut changes = Vec::new();
            let known = match state.agents.get_mut(id) {
                Some(beat) => {
                    beat.last_beat = Instant::now();
                    if let Some(turns) = update.turn_count {
                        beat.turn_count = turns;
                    }
                    if let Some(usage) = update.token_usage {
                        beat.token_usage = usage;
                    }
                    true
                }
                None => false,
            };
            if known && state.agents.get(id).map(|b| b.status) == Some(AgentStatus::Stale) {
                Self::transition(&mut state.agents, &mut changes, id, AgentStatus::Alive);
            }
            (known, changes, state.observers.clone())
        };
        Self::notify(&observers, &changes);
        known
    }

    fn simple_transition(&self, id: &str, status: AgentStatus) -> bool {
        let (known, changes, observers) = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return false;
            }
            let known = state.agents.contains_key(id);
            let mut changes = Vec::new();
            if known {
                Self::transition(&mut state.agents, &mut changes, id, status);
            }
            (known, changes, state.observers.clone())
        };
        Self::notify(&observers, &changes);
        known
    }

    pub fn mark_completed(&self, id: &str) -> bool {
        self.simple_transition(id, AgentStatus::Completed)
    }

    pub fn mark_error(&self, id: &str) -> bool {
        self.simple_transition(id, AgentStatus::Error)
    }

    /// An agent reporting itself wedged: status goes stale with a reason.
    pub fn report_stuck(&self, id: &str, reason: &str) -> bool {
        let (known, changes, observers) = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return false;
            }
            let mut changes = Vec::new();
            let known = state.agents.contains_key(id);
            if known {
                if let Some(beat) = state.agents.get_mut(id) {
                    beat.stuck_reason = Some(reason.to_string());
                }
                Self::transition(&mut state.agents, &mut changes, id, AgentStatus::Stale);
            }
            (known, changes, state.observers.clone())
        };
        Self::notify(&observers, &changes);
        known
    }

    /// Revive a stale or errored descendant. Only ancestors may heal.
    pub fn heal_agent(&self, healer_id: &str, target_id: &str) -> bool {
        let (healed, changes, observers) = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return false;
            }
            let eligible = Self::is_ancestor(&state.agents, healer_id, target_id)
                && matches!(
                    state.agents.get(target_id).map(|b| b.status),
                    Some(AgentStatus::Stale) | Some(AgentStatus::Error)
                );
            let mut changes = Vec::new();
            if eligible {
                if let Some(beat) = state.agents.get_mut(target_id) {
                    beat.last_beat = Instant::now();
                    beat.stuck_reason = None;
                }
                Self::transition(&mut state.agents, &mut changes, target_id, AgentStatus::Alive);
            }
            (eligible, changes, state.observers.clone())
        };
        Self::notify(&observers, &changes);
        healed
    }

    // ==========================================
    // Kill cascade
    // ==========================================

    /// Kill a subtree, leaves first. The killer must be an ancestor of the
    /// target; an already killed or completed target is refused.
    pub fn kill_agent(&self, killer_id: &str, target_id: &str) -> KillResult {
        let (result, changes, observers) = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return KillResult::refused("manager disposed");
            }
            if !state.agents.contains_key(target_id) {
                return KillResult::refused(format!("unknown agent {}", target_id));
            }
            if !Self::is_ancestor(&state.agents, killer_id, target_id) {
                return KillResult::refused(format!("{} is not an ancestor of {}", killer_id, target_id));
            }
            match state.agents.get(target_id).map(|b| b.status) {
                Some(AgentStatus::Killed) | Some(AgentStatus::Completed) => {
                    return KillResult::refused(format!("{} already finished", target_id));
                }
                _ => {}
            }

            let mut order = Self::descendants_deepest_first(&state.agents, target_id);
            order.push(target_id.to_string());

            let mut changes = Vec::new();
            let mut freed_tokens = 0u64;
            let mut killed_ids = Vec::with_capacity(order.len());
            for id in order {
                let already_done = state
                    .agents
                    .get(&id)
                    .map(|b| b.status.is_terminal())
                    .unwrap_or(true);
                if already_done && id != target_id {
                    continue;
                }
                if let Some(beat) = state.agents.get(&id) {
                    freed_tokens += beat.remaining_budget();
                }
                Self::transition(&mut state.agents, &mut changes, &id, AgentStatus::Killed);
                killed_ids.push(id);
            }

            info!(target = %target_id, killed = killed_ids.len(), freed_tokens, "kill cascade");
            (
                KillResult {
                    success: true,
                    reason: None,
                    killed_ids,
                    freed_tokens,
                },
                changes,
                state.observers.clone(),
            )
        };
        Self::notify(&observers, &changes);
        result
    }

    // ==========================================
    // Spawn checks
    // ==========================================

    pub fn can_spawn(&self, parent_id: &str) -> SpawnCheck {
        let state = self.state.lock().unwrap();
        if state.disposed {
            return SpawnCheck::refused("manager disposed");
        }
        let parent = match state.agents.get(parent_id) {
            Some(parent) => parent,
            None => return SpawnCheck::refused(format!("unknown parent {}", parent_id)),
        };
        if parent.status != AgentStatus::Alive {
            return SpawnCheck::refused(format!(
                "parent is {}, not alive",
                parent.status.as_str()
            ));
        }
        if parent.depth + 1 > self.effective_max_depth() {
            return SpawnCheck::refused(format!(
                "child depth {} would exceed max {}",
                parent.depth + 1,
                self.effective_max_depth()
            ));
        }
        let live_children = state
            .agents
            .values()
            .filter(|b| b.parent_id.as_deref() == Some(parent_id) && b.status.counts_as_live())
            .count();
        if live_children >= self.effective_max_fan_out() {
            return SpawnCheck::refused(format!(
                "parent already has {} live children",
                live_children
            ));
        }
        let live_total = state
            .agents
            .values()
            .filter(|b| b.status.counts_as_live())
            .count();
        if live_total >= self.config.global_max_agents {
            return SpawnCheck::refused(format!("global agent limit {} reached", live_total));
        }
        let child_budget = (parent.token_budget as f64 * self.config.budget_decay_factor) as u64;
        if child_budget < self.config.min_token_budget_for_spawn {
            return SpawnCheck::refused(format!(
                "child budget {} below spawn minimum {}",
                child_budget, self.config.min_token_budget_for_spawn
            ));
        }
        SpawnCheck::permitted()
    }

    /// Budget a child would get: `floor(parent_budget * decay_factor)`.
    pub fn compute_child_budget(&self, parent_id: &str) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state
            .agents
            .get(parent_id)
            .map(|parent| (parent.token_budget as f64 * self.config.budget_decay_factor) as u64)
    }

    // ==========================================
    // The sweep
    // ==========================================

    /// One full heal sweep: staleness aging, dead cascades, reaping,
    /// orphan resolution, over-budget kills.
    pub fn heal_tree(&self) -> HealReport {
        let started = Instant::now();
        let (mut report, changes, observers) = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return HealReport::default();
            }
            let mut report = HealReport::default();
            let mut changes = Vec::new();
            report.checked = state.agents.len();

            let stale_after = Duration::from_millis(self.config.stale_threshold_ms);
            let dead_after = Duration::from_millis(self.config.dead_threshold_ms);
            let now = Instant::now();

            // 1. Age alive → stale → dead.
            let ids: Vec<String> = state.agents.keys().cloned().collect();
            for id in &ids {
                let (status, silent_for) = match state.agents.get(id) {
                    Some(beat) => (beat.status, now.saturating_duration_since(beat.last_beat)),
                    None => continue,
                };
                match status {
                    AgentStatus::Alive if silent_for >= stale_after => {
                        Self::transition(&mut state.agents, &mut changes, id, AgentStatus::Stale);
                        report.marked_stale += 1;
                    }
                    AgentStatus::Stale if silent_for >= dead_after => {
                        Self::transition(&mut state.agents, &mut changes, id, AgentStatus::Dead);
                        report.marked_dead += 1;
                    }
                    _ => {}
                }
            }

            // 2. Cascade-kill descendants of the dead, leaves first.
            let dead_ids: Vec<String> = state
                .agents
                .values()
                .filter(|b| b.status == AgentStatus::Dead)
                .map(|b| b.agent_id.clone())
                .collect();
            for dead in &dead_ids {
                for id in Self::descendants_deepest_first(&state.agents, dead) {
                    let terminal = state
                        .agents
                        .get(&id)
                        .map(|b| b.status.is_terminal())
                        .unwrap_or(true);
                    if !terminal {
                        Self::transition(&mut state.agents, &mut changes, &id, AgentStatus::Killed);
                    }
                }
            }

            // 3. Over-budget agents become killed. Their children turn
            // into orphans and are resolved below, in the same sweep.
            let over_budget: Vec<String> = state
                .agents
                .values()
                .filter(|b| b.status == AgentStatus::Alive && b.token_usage > b.token_budget)
                .map(|b| b.agent_id.clone())
                .collect();
            for id in &over_budget {
                Self::transition(&mut state.agents, &mut changes, id, AgentStatus::Killed);
                report.over_budget_killed += 1;
            }

            // 4. Reap dead and killed; remember parent links for orphan
            // resolution below.
            let mut reaped_parents: HashMap<String, Option<String>> = HashMap::new();
            let reap: Vec<String> = state
                .agents
                .values()
                .filter(|b| matches!(b.status, AgentStatus::Dead | AgentStatus::Killed))
                .map(|b| b.agent_id.clone())
                .collect();
            for id in reap {
                if let Some(beat) = state.agents.remove(&id) {
                    reaped_parents.insert(id.clone(), beat.parent_id);
                    report.reaped_ids.push(id);
                }
            }

            // 5. Orphans: parent no longer exists.
            let orphan_ids: Vec<String> = state
                .agents
                .values()
                .filter(|b| {
                    b.parent_id
                        .as_ref()
                        .map(|p| !state.agents.contains_key(p))
                        .unwrap_or(false)
                })
                .map(|b| b.agent_id.clone())
                .collect();
            for orphan in &orphan_ids {
                report.orphans_resolved += 1;
                match self.config.orphan_policy {
                    OrphanPolicy::Cascade => {
                        for id in Self::descendants_deepest_first(&state.agents, orphan) {
                            Self::transition(&mut state.agents, &mut changes, &id, AgentStatus::Killed);
                        }
                        Self::transition(&mut state.agents, &mut changes, orphan, AgentStatus::Killed);
                    }
                    OrphanPolicy::Reparent => {
                        // Walk the reaped chain to the nearest surviving
                        // ancestor; promote when the whole chain is gone.
                        let mut ancestor = state
                            .agents
                            .get(orphan)
                            .and_then(|b| b.parent_id.clone());
                        for _ in 0..=SYSTEM_MAX_DEPTH {
                            let next = match &ancestor {
                                Some(id) if state.agents.contains_key(id) => break,
                                Some(id) => reaped_parents.get(id).cloned().flatten(),
                                None => break,
                            };
                            ancestor = next;
                        }
                        if let Some(new_parent) = ancestor {
                            let new_depth = state
                                .agents
                                .get(&new_parent)
                                .map(|b| b.depth + 1)
                                .unwrap_or(0);
                            if let Some(beat) = state.agents.get_mut(orphan) {
                                beat.parent_id = Some(new_parent);
                                beat.depth = new_depth;
                            }
                        } else if let Some(beat) = state.agents.get_mut(orphan) {
                            beat.parent_id = None;
                            beat.depth = 0;
                        }
                    }
                    OrphanPolicy::Promote => {
                        if let Some(beat) = state.agents.get_mut(orphan) {
                            beat.parent_id = None;
                            beat.depth = 0;
                        }
                    }
                }
            }

            // Final reap so the invariant holds: no dead or killed agents
            // survive a sweep.
            let reap: Vec<String> = state
                .agents
                .values()
                .filter(|b| matches!(b.status, AgentStatus::Dead | AgentStatus::Killed))
                .map(|b| b.agent_id.clone())
                .collect();
            for id in reap {
                state.agents.remove(&id);
                report.reaped_ids.push(id);
            }

            (report, changes, state.observers.clone())
        };
        Self::notify(&observers, &changes);
        report.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            checked = report.checked,
            reaped = report.reaped_ids.len(),
            orphans = report.orphans_resolved,
            "heal sweep"
        );
        report
    }

    // ==========================================
    // Monitoring
    // ==========================================

    /// Start the periodic sweep. Self-reschedules with an elapsed-adjusted
    /// delay so sweeps never overlap; exits on `stop_monitoring` or
    /// `dispose`.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);

        let handle = tokio::spawn(async move {
            let mut delay = interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let sweep_start = Instant::now();
                let report = manager.heal_tree();
                if !report.reaped_ids.is_empty() {
                    info!(reaped = report.reaped_ids.len(), "sweep reaped agents");
                }
                delay = interval.saturating_sub(sweep_start.elapsed());
            }
        });

        *monitor = Some(MonitorHandle {
            shutdown_tx,
            handle,
        });
    }

    pub fn stop_monitoring(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            let _ = monitor.shutdown_tx.send(true);
            monitor.handle.abort();
        }
    }

    // ==========================================
    // Observers & views
    // ==========================================

    pub fn subscribe(&self, observer: impl Fn(&StatusChange) + Send + Sync + 'static) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_observer_id;
        state.next_observer_id += 1;
        state.observers.push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.observers.retain(|(observer_id, _)| *observer_id != id);
    }

    pub fn agent(&self, id: &str) -> Option<Heartbeat> {
        self.state.lock().unwrap().agents.get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Heartbeat> {
        let mut agents: Vec<Heartbeat> =
            self.state.lock().unwrap().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .agents
            .values()
            .filter(|b| b.status.counts_as_live())
            .count()
    }

    /// Force-kill everything, clear the map, and refuse further mutation.
    pub fn dispose(&self) {
        self.stop_monitoring();
        let (changes, observers) = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            let mut changes = Vec::new();
            let ids: Vec<String> = state
                .agents
                .values()
                .filter(|b| b.status.counts_as_live())
                .map(|b| b.agent_id.clone())
                .collect();
            for id in ids {
                Self::transition(&mut state.agents, &mut changes, &id, AgentStatus::Killed);
            }
            state.agents.clear();
            state.disposed = true;
            (changes, state.observers.clone())
        };
        Self::notify(&observers, &changes);
        info!("lifecycle manager disposed");
    }
}
