use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sutradhar_core::unique_millis;
use sutradhar_engine::consolidate::{
    decay_strength, extract_patterns, mine_procedures, promote_vasanas,
};
use sutradhar_engine::{ConsolidatorConfig, Crystallizer, ReplaySession, ReplayToolCall, ReplayTurn};
use sutradhar_store::{ConsolidationLogRow, Database};
use tokio::sync::watch;
use tracing::{info, warn};

/// Dream-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DreamState {
    /// Normal runtime; watching for idleness.
    Listening,
    /// A consolidation cycle is executing.
    Dreaming,
    /// Post-cycle cooldown.
    DeepSleep,
}

/// Counts from one completed dream cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub sessions_scanned: u64,
    pub patterns_found: u64,
    pub crystallized: u64,
    pub promoted: u64,
    pub procedures_mined: u64,
    pub vasanas_deleted: u64,
}

/// Offline consolidation driver: REPLAY → RECOMBINE → CRYSTALLIZE →
/// PROCEDURALIZE → COMPRESS, guarded by a process-wide dreaming flag so
/// cycles never overlap.
pub struct DreamCycle {
    config: ConsolidatorConfig,
    store: Arc<Mutex<Database>>,
    project: String,
    state: Mutex<DreamState>,
    dreaming: AtomicBool,
    crystallizer: Mutex<Crystallizer>,
    last_activity: Mutex<Instant>,
    deep_sleep_until: Mutex<Option<Instant>>,
    monitor: Mutex<Option<(watch::Sender<bool>, tokio::task::JoinHandle<()>)>>,
}

impl DreamCycle {
    pub fn new(config: ConsolidatorConfig, store: Arc<Mutex<Database>>, project: String) -> Self {
        Self {
            crystallizer: Mutex::new(Crystallizer::new(config.clone())),
            config,
            store,
            project,
            state: Mutex::new(DreamState::Listening),
            dreaming: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            deep_sleep_until: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DreamState {
        *self.state.lock().unwrap()
    }

    /// Tell the cycle the runtime is busy; resets the idle clock.
    pub fn note_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Acquire the exclusive dreaming guard. Rejected while a cycle or its
    /// deep-sleep cooldown is in flight.
    pub fn try_begin_dream(&self) -> bool {
        if self
            .dreaming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.state.lock().unwrap() = DreamState::Dreaming;
        true
    }

    fn enter_deep_sleep(&self) {
        *self.state.lock().unwrap() = DreamState::DeepSleep;
        *self.deep_sleep_until.lock().unwrap() =
            Some(Instant::now() + Duration::from_millis(self.config.deep_sleep_duration_ms));
    }

    fn wake(&self) {
        *self.state.lock().unwrap() = DreamState::Listening;
        *self.deep_sleep_until.lock().unwrap() = None;
        self.dreaming.store(false, Ordering::SeqCst);
    }

    fn log_phase(
        &self,
        phase: &str,
        status: &str,
        detail: Option<String>,
        report: &CycleReport,
        duration_ms: u64,
    ) {
        let row = ConsolidationLogRow {
            ts: Utc::now().to_rfc3339(),
            phase: phase.to_string(),
            status: status.to_string(),
            detail,
            sessions_scanned: report.sessions_scanned,
            patterns_found: report.patterns_found,
            crystallized: report.crystallized,
            procedures_mined: report.procedures_mined,
            duration_ms,
        };
        let store = self.store.lock().unwrap();
        if let Err(err) = store.append_consolidation_log(&row) {
            warn!(phase, error = %err, "failed to log consolidation phase");
        }
    }

    /// Execute one full cycle. The caller must hold the dreaming guard
    /// (via `try_begin_dream`). Each phase commits independently; a phase
    /// failure is logged and aborts the rest of the cycle without
    /// corrupting earlier phases.
    pub fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let mut report = CycleReport::default();
        let now_ms = unique_millis();

        // ---- REPLAY ----
        let started = Instant::now();
        let sessions = match self.replay() {
            Ok(sessions) => {
                report.sessions_scanned = sessions.len() as u64;
                self.log_phase("replay", "ok", None, &report, elapsed_ms(started));
                sessions
            }
            Err(err) => {
                self.log_phase("replay", "failed", Some(err.to_string()), &report, elapsed_ms(started));
                return Err(err);
            }
        };

        // ---- RECOMBINE ----
        let started = Instant::now();
        let observations = extract_patterns(&sessions, self.config.min_pattern_frequency);
        {
            let store = self.store.lock().unwrap();
            for observation in &observations {
                if let Err(err) = store.upsert_samskara(&observation.samskara) {
                    self.log_phase(
                        "recombine",
                        "failed",
                        Some(err.to_string()),
                        &report,
                        elapsed_ms(started),
                    );
                    return Err(err);
                }
            }
        }
        report.patterns_found = observations.len() as u64;
        self.log_phase("recombine", "ok", None, &report, elapsed_ms(started));

        // ---- CRYSTALLIZE ----
        let started = Instant::now();
        match self.crystallize(&observations, now_ms) {
            Ok((crystallized, promoted)) => {
                report.crystallized = crystallized;
                report.promoted = promoted;
                self.log_phase("crystallize", "ok", None, &report, elapsed_ms(started));
            }
            Err(err) => {
                self.log_phase(
                    "crystallize",
                    "failed",
                    Some(err.to_string()),
                    &report,
                    elapsed_ms(started),
                );
                return Err(err);
            }
        }

        // ---- PROCEDURALIZE ----
        let started = Instant::now();
        match self.proceduralize(&sessions) {
            Ok(mined) => {
                report.procedures_mined = mined;
                self.log_phase("proceduralize", "ok", None, &report, elapsed_ms(started));
            }
            Err(err) => {
                self.log_phase(
                    "proceduralize",
                    "failed",
                    Some(err.to_string()),
                    &report,
                    elapsed_ms(started),
                );
                return Err(err);
            }
        }

        // ---- COMPRESS ----
        let started = Instant::now();
        match self.compress(now_ms) {
            Ok(deleted) => {
                report.vasanas_deleted = deleted;
                self.log_phase("compress", "ok", None, &report, elapsed_ms(started));
            }
            Err(err) => {
                self.log_phase(
                    "compress",
                    "failed",
                    Some(err.to_string()),
                    &report,
                    elapsed_ms(started),
                );
                return Err(err);
            }
        }

        info!(
            sessions = report.sessions_scanned,
            patterns = report.patterns_found,
            crystallized = report.crystallized,
            procedures = report.procedures_mined,
            "dream cycle complete"
        );
        Ok(report)
    }

    /// Load recent sessions into replayable form.
    fn replay(&self) -> anyhow::Result<Vec<ReplaySession>> {
        let store = self.store.lock().unwrap();
        let records = store.recent_sessions(self.config.max_sessions_per_cycle)?;

        let mut sessions = Vec::with_capacity(records.len());
        for record in records {
            let turns = store.turns_for_session(&record.id)?;
            let replay_turns: Vec<ReplayTurn> = turns
                .iter()
                .map(|turn| ReplayTurn {
                    role: turn.role,
                    content: turn.text(),
                    tool_calls: turn
                        .tool_calls()
                        .into_iter()
                        .map(|call| ReplayToolCall {
                            name: call.name,
                            arguments: serde_json::from_str(&call.arguments)
                                .unwrap_or(serde_json::Value::Null),
                            success: !call.is_error,
                        })
                        .collect(),
                })
                .collect();
            sessions.push(ReplaySession {
                session_id: record.id,
                project: record.project,
                turns: replay_turns,
            });
        }
        // Oldest first so per-pattern series line up with session order.
        sessions.reverse();
        Ok(sessions)
    }

    fn crystallize(
        &self,
        observations: &[sutradhar_engine::PatternObservation],
        now_ms: i64,
    ) -> anyhow::Result<(u64, u64)> {
        let existing: HashMap<String, sutradhar_types::Vasana> = {
            let store = self.store.lock().unwrap();
            store
                .list_vasanas(&self.project)?
                .into_iter()
                .map(|vasana| (vasana.id.clone(), vasana))
                .collect()
        };

        let changes = self
            .crystallizer
            .lock()
            .unwrap()
            .crystallize(observations, &existing, now_ms);

        let crystallized = changes.len() as u64;
        {
            let store = self.store.lock().unwrap();
            for change in &changes {
                store.upsert_vasana(change.vasana())?;
            }
        }

        // Promotion pass across projects.
        let promoted = {
            let store = self.store.lock().unwrap();
            let all = store.list_all_vasanas()?;
            let promoted = promote_vasanas(&all, self.config.promotion_min_projects, now_ms);
            for vasana in &promoted {
                store.upsert_vasana(vasana)?;
            }
            promoted.len() as u64
        };

        Ok((crystallized, promoted))
    }

    fn proceduralize(&self, sessions: &[ReplaySession]) -> anyhow::Result<u64> {
        let existing: HashSet<String> = {
            let store = self.store.lock().unwrap();
            store
                .list_vidhis(&self.project)?
                .into_iter()
                .map(|vidhi| vidhi.id)
                .collect()
        };

        let vidhis = mine_procedures(sessions, &existing, &self.config);
        let store = self.store.lock().unwrap();
        let mut mined = 0u64;
        for vidhi in &vidhis {
            if store.insert_vidhi_if_absent(vidhi)? {
                mined += 1;
            }
        }
        Ok(mined)
    }

    /// Decay tendencies and delete the ones that faded out.
    fn compress(&self, now_ms: i64) -> anyhow::Result<u64> {
        let store = self.store.lock().unwrap();
        let all = store.list_all_vasanas()?;
        for mut vasana in all {
            let elapsed = now_ms - vasana.last_activated_ms;
            vasana.strength =
                decay_strength(vasana.strength, elapsed, self.config.decay_half_life_ms);
            store.upsert_vasana(&vasana)?;
        }
        let deleted = store.delete_weak_vasanas(0.01)?;
        Ok(deleted as u64)
    }

    // ==========================================
    // Timer loop
    // ==========================================

    /// Start the state-machine timer: idle detection in LISTENING,
    /// cooldown tracking in DEEP_SLEEP. Cycles run on the blocking pool so
    /// the scheduler stays responsive.
    pub fn start(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cycle = Arc::clone(self);

        let handle = tokio::spawn(async move {
            loop {
                let interval = match cycle.state() {
                    DreamState::Listening => cycle.config.listening_heartbeat_ms,
                    DreamState::Dreaming => cycle.config.dreaming_heartbeat_ms,
                    DreamState::DeepSleep => cycle.config.deep_sleep_heartbeat_ms,
                };
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match cycle.state() {
                    DreamState::Listening => {
                        let idle = cycle.last_activity.lock().unwrap().elapsed();
                        if idle >= Duration::from_millis(cycle.config.idle_timeout_ms)
                            && cycle.try_begin_dream()
                        {
                            let runner = Arc::clone(&cycle);
                            let result = tokio::task::spawn_blocking(move || {
                                let outcome = runner.run_cycle();
                                runner.enter_deep_sleep();
                                outcome
                            })
                            .await;
                            if let Ok(Err(err)) = result {
                                warn!(error = %err, "dream cycle failed");
                            }
                        }
                    }
                    DreamState::Dreaming => {}
                    DreamState::DeepSleep => {
                        let expired = cycle
                            .deep_sleep_until
                            .lock()
                            .unwrap()
                            .map(|until| Instant::now() >= until)
                            .unwrap_or(true);
                        if expired {
                            cycle.wake();
                        }
                    }
                }
            }
        });

        *monitor = Some((shutdown_tx, handle));
    }

    pub fn stop(&self) {
        if let Some((shutdown_tx, handle)) = self.monitor.lock().unwrap().take() {
            let _ = shutdown_tx.send(true);
            handle.abort();
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use sutradhar_types::{ContentPart, Role, Turn};

    fn seeded_store(sessions: usize) -> Arc<Mutex<Database>> {
        let mut db = Database::open_in_memory().unwrap();
        for index in 0..sessions {
            let session_id = format!("s{}", index);
            db.ensure_session(&session_id, "demo").unwrap();

            let mut turn = Turn::new(&session_id, 0, Role::Assistant);
            let file = format!("src/file{}.rs", index);
            turn.parts = vec![
                ContentPart::ToolUse {
                    id: "t1".to_string(),
                    name: "read".to_string(),
                    arguments: format!(r#"{{"file_path":"{}"}}"#, file),
                },
                ContentPart::ToolResult {
                    tool_use_id: "t1".to_string(),
                    content: "contents".to_string(),
                    is_error: false,
                },
                ContentPart::ToolUse {
                    id: "t2".to_string(),
                    name: "edit".to_string(),
                    arguments: format!(r#"{{"file_path":"{}","dry_run":false}}"#, file),
                },
                ContentPart::ToolResult {
                    tool_use_id: "t2".to_string(),
                    content: "edited".to_string(),
                    is_error: false,
                },
                ContentPart::ToolUse {
                    id: "t3".to_string(),
                    name: "bash".to_string(),
                    arguments: r#"{"command":"cargo test"}"#.to_string(),
                },
                ContentPart::ToolResult {
                    tool_use_id: "t3".to_string(),
                    content: "ok".to_string(),
                    is_error: false,
                },
            ];
            db.append_turn(&turn).unwrap();
        }
        Arc::new(Mutex::new(db))
    }

    fn cycle_with(store: Arc<Mutex<Database>>) -> DreamCycle {
        DreamCycle::new(ConsolidatorConfig::default(), store, "demo".to_string())
    }

    #[test]
    fn test_full_cycle_produces_samskara_vasana_and_vidhi() {
        let store = seeded_store(5);
        let cycle = cycle_with(store.clone());
        assert!(cycle.try_begin_dream());

        let report = cycle.run_cycle().unwrap();
        assert_eq!(report.sessions_scanned, 5);
        assert!(report.patterns_found >= 1);
        assert_eq!(report.crystallized, 1);
        assert_eq!(report.procedures_mined, 1);

        let db = store.lock().unwrap();

        let samskaras = db.list_samskaras("demo").unwrap();
        let sequence = samskaras
            .iter()
            .find(|s| s.content == "read,edit,bash")
            .expect("tool-sequence samskara");
        assert_eq!(sequence.observation_count, 5);

        let vasanas = db.list_vasanas("demo").unwrap();
        let vasana = vasanas
            .iter()
            .find(|v| v.tendency == "read-then-edit-then-bash")
            .expect("crystallized vasana");
        assert!(vasana.strength >= 0.5);
        assert!(vasana.stability >= 0.6);

        let vidhis = db.list_vidhis("demo").unwrap();
        let vidhi = vidhis
            .iter()
            .find(|v| v.name == "read-then-edit-then-bash")
            .expect("mined vidhi");
        assert_eq!(vidhi.steps.len(), 3);
        assert!(vidhi.confidence > 0.0);
        assert!(vidhi
            .parameter_schema
            .iter()
            .any(|p| p.name.contains("param_")));

        let logs = db.recent_consolidation_logs(10).unwrap();
        assert_eq!(logs.len(), 5);
        assert!(logs.iter().all(|row| row.status == "ok"));
    }

    #[test]
    fn test_cycle_is_idempotent_on_same_input() {
        let store = seeded_store(5);
        let cycle = cycle_with(store.clone());
        assert!(cycle.try_begin_dream());
        cycle.run_cycle().unwrap();
        cycle.wake();

        assert!(cycle.try_begin_dream());
        let second = cycle.run_cycle().unwrap();
        // Same replay window: samskara counts must not double, and no new
        // procedure appears.
        assert_eq!(second.procedures_mined, 0);

        let db = store.lock().unwrap();
        let samskaras = db.list_samskaras("demo").unwrap();
        let sequence = samskaras
            .iter()
            .find(|s| s.content == "read,edit,bash")
            .unwrap();
        assert_eq!(sequence.observation_count, 5);
    }

    #[test]
    fn test_dream_guard_rejects_overlap() {
        let store = seeded_store(1);
        let cycle = cycle_with(store);

        assert!(cycle.try_begin_dream());
        assert_eq!(cycle.state(), DreamState::Dreaming);
        // A concurrent cycle is refused until deep sleep completes.
        assert!(!cycle.try_begin_dream());

        cycle.enter_deep_sleep();
        assert_eq!(cycle.state(), DreamState::DeepSleep);
        assert!(!cycle.try_begin_dream());

        cycle.wake();
        assert_eq!(cycle.state(), DreamState::Listening);
        assert!(cycle.try_begin_dream());
    }

    #[test]
    fn test_two_sessions_do_not_crystallize_enough_stability() {
        let store = seeded_store(2);
        let cycle = cycle_with(store.clone());
        assert!(cycle.try_begin_dream());
        let report = cycle.run_cycle().unwrap();

        // Two observations cannot satisfy the default stability window of
        // three, and two sessions cannot satisfy procedure spread.
        assert_eq!(report.crystallized, 0);
        assert_eq!(report.procedures_mined, 0);
        assert!(report.patterns_found >= 1);
    }
}
