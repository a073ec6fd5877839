use crate::lifecycle::LifecycleManager;
use crate::tools::{ToolContext, ToolRegistry};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sutradhar_engine::{extract_context, MetacogSnapshot, Metacognition, RouterSnapshot, TierRouter};
use sutradhar_guard::{GuardianPipeline, PolicyEngine};
use sutradhar_providers::{
    with_retries, CancelToken, Context, ModelProvider, RateLimiter, RateLimits, StreamOptions,
};
use sutradhar_store::Database;
use sutradhar_types::{
    BeatUpdate, ContentPart, CostBreakdown, Heartbeat, PolicyAction, PolicyContext, Role,
    RoutePreference, StopReason, StreamEvent, Tier, TokenUsage, ToolObservation, ToolOutcome,
    Turn,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which phases a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// plan → branch → execute → validate → review → commit
    Full,
    /// execute → validate only
    Execute,
    /// stop after planning
    PlanOnly,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Full
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Branch,
    Execute,
    Validate,
    Review,
    Commit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Branch => "branch",
            Phase::Execute => "execute",
            Phase::Validate => "validate",
            Phase::Review => "review",
            Phase::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub ok: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One issue raised by the review phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: String,
    pub category: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub session_id: String,
    pub phases: Vec<PhaseOutcome>,
    pub errors: Vec<String>,
    pub review_issues: Vec<ReviewIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Structured user-visible failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub recoverable: bool,
}

impl RunResult {
    /// The first failure, structured for display. `None` on success.
    pub fn failure(&self) -> Option<RunFailure> {
        if self.status == RunStatus::Success {
            return None;
        }
        let failed_phase = self.phases.iter().find(|p| !p.ok);
        let message = failed_phase
            .and_then(|p| p.error.clone())
            .or_else(|| self.errors.first().cloned())
            .unwrap_or_else(|| "run did not complete".to_string());
        Some(RunFailure {
            code: match self.status {
                RunStatus::Aborted => "aborted".to_string(),
                RunStatus::Failed => "failed".to_string(),
                _ => "partial".to_string(),
            },
            message,
            phase: failed_phase.map(|p| p.phase.as_str().to_string()),
            recoverable: self.status == RunStatus::Partial,
        })
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: RunMode,
    pub create_branch: bool,
    pub branch_prefix: String,
    pub commit: bool,
    pub test_command: Option<String>,
    pub phase_timeout_ms: u64,
    pub tolerate_failures: bool,
    /// Model-call rounds allowed per agent phase.
    pub max_steps: usize,
    /// Backoff-bounded retries for transient provider errors.
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Full,
            create_branch: false,
            branch_prefix: "sutradhar/".to_string(),
            commit: false,
            test_command: None,
            phase_timeout_ms: 120_000,
            tolerate_failures: false,
            max_steps: 8,
            max_retries: 3,
        }
    }
}

/// First-retry backoff; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// The plan the planner sub-agent must produce.
#[derive(Debug, Clone, Default, Deserialize)]
struct Plan {
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default)]
    complexity: String,
    #[serde(default)]
    requires_new_files: bool,
    #[serde(default)]
    relevant_files: Vec<String>,
}

const PLANNER_PROMPT: &str = "You are the planning agent. Break the task into concrete steps. \
Reply with a JSON object: {\"steps\": [...], \"complexity\": \"small|medium|large\", \
\"requires_new_files\": bool, \"relevant_files\": [...]}.";

const KARTRU_PROMPT: &str = "You are the maker agent. Execute the plan using the available \
tools. Work step by step; stop when the task is done.";

const PARIKSHAKA_PROMPT: &str = "You are the review agent with read-only tools. Inspect the \
changes and reply with a JSON array of issues: [{\"severity\": ..., \"category\": ..., \
\"file\": ..., \"line\": ..., \"message\": ..., \"suggestion\": ...}].";

#[derive(Default)]
struct SessionCounters {
    files_modified: u64,
    commands_run: u64,
    session_cost: f64,
}

struct AgentRunOutput {
    final_text: String,
    tool_errors: u64,
    tool_calls: u64,
}

/// Accumulated events from one provider stream.
struct StreamedTurn {
    parts: Vec<ContentPart>,
    pending_calls: Vec<(String, String, String)>,
    usage: TokenUsage,
    stop_reason: StopReason,
    cost: Option<f64>,
}

/// Per-turn facts handed to the guardian pipeline with each tool call.
#[derive(Clone, Copy)]
struct TurnMetrics {
    turn_number: u64,
    tokens_this_turn: u64,
    context_used_pct: f64,
}

/// Drives one task through plan → branch → execute → validate → review →
/// commit, spawning sub-agents under the lifecycle manager and routing
/// every model call through the tier router and every tool call through
/// policy and guardians.
pub struct TaskRunner {
    lifecycle: Arc<LifecycleManager>,
    router: Mutex<TierRouter>,
    policy: Mutex<PolicyEngine>,
    guardians: Arc<GuardianPipeline>,
    metacog: Mutex<Metacognition>,
    store: Arc<Mutex<Database>>,
    provider: Arc<dyn ModelProvider>,
    tools: ToolRegistry,
    config: OrchestratorConfig,
    project_root: PathBuf,
    cancel: CancelToken,
    counters: Mutex<SessionCounters>,
    preference: RoutePreference,
    limiter: RateLimiter,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        router: TierRouter,
        policy: PolicyEngine,
        guardians: Arc<GuardianPipeline>,
        metacog: Metacognition,
        store: Arc<Mutex<Database>>,
        provider: Arc<dyn ModelProvider>,
        tools: ToolRegistry,
        config: OrchestratorConfig,
        project_root: PathBuf,
    ) -> Self {
        Self {
            lifecycle,
            router: Mutex::new(router),
            policy: Mutex::new(policy),
            guardians,
            metacog: Mutex::new(metacog),
            store,
            provider,
            tools,
            config,
            project_root,
            cancel: CancelToken::new(),
            counters: Mutex::new(SessionCounters::default()),
            preference: RoutePreference::default(),
            limiter: RateLimiter::new(RateLimits::default()),
        }
    }

    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.limiter = RateLimiter::new(limits);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Serialized bandit state, for persistence across sessions.
    pub fn export_router(&self) -> serde_json::Result<String> {
        let snapshot: RouterSnapshot = self.router.lock().unwrap().snapshot();
        serde_json::to_string(&snapshot)
    }

    /// Serialized metacognitive state, for persistence across sessions.
    pub fn export_metacog(&self) -> serde_json::Result<String> {
        let snapshot: MetacogSnapshot = self.metacog.lock().unwrap().snapshot();
        serde_json::to_string(&snapshot)
    }

    /// Run one task to completion.
    pub async fn run(&self, task: &str) -> RunResult {
        let session_id = Uuid::new_v4().to_string();
        let project = self
            .project_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string());

        {
            let store = self.store.lock().unwrap();
            if let Err(err) = store.ensure_session(&session_id, &project) {
                return RunResult {
                    status: RunStatus::Failed,
                    session_id,
                    phases: Vec::new(),
                    errors: vec![format!("session init: {}", err)],
                    review_issues: Vec::new(),
                    branch: None,
                };
            }
        }

        let root_id = format!("root-{}", &session_id[..8]);
        let root_budget = self.lifecycle.config().root_token_budget;
        if let Err(err) =
            self.lifecycle
                .register_agent(Heartbeat::new(&root_id, None, 0, task, root_budget))
        {
            // Aborted is terminal too; the session row must still close.
            {
                let store = self.store.lock().unwrap();
                let _ = store.close_session(&session_id);
            }
            return RunResult {
                status: RunStatus::Aborted,
                session_id,
                phases: Vec::new(),
                errors: vec![err.to_string()],
                review_issues: Vec::new(),
                branch: None,
            };
        }

        let mut result = RunResult {
            status: RunStatus::Success,
            session_id: session_id.clone(),
            phases: Vec::new(),
            errors: Vec::new(),
            review_issues: Vec::new(),
            branch: None,
        };

        let mut mode = self.config.mode;
        let mut plan_text = task.to_string();
        info!(task, mode = ?mode, "run started");

        // ---- Plan ----
        if mode != RunMode::Execute {
            let started = Instant::now();
            match self
                .phase_with_timeout(self.plan_phase(&root_id, &session_id, task))
                .await
            {
                Ok(plan) => {
                    plan_text = render_plan(task, &plan);
                    result.phases.push(phase_ok(Phase::Plan, started));
                }
                Err(err) => {
                    // Recoverable: degrade to execute mode with the raw task.
                    warn!(error = %err, "plan phase failed; continuing in execute mode");
                    result.errors.push(format!("plan: {}", err));
                    result.phases.push(phase_err(Phase::Plan, started, &err));
                    result.status = RunStatus::Partial;
                    mode = RunMode::Execute;
                }
            }
            if self.config.mode == RunMode::PlanOnly {
                self.finish(&root_id, &session_id);
                return result;
            }
        }

        // ---- Branch ----
        if mode == RunMode::Full && self.config.create_branch {
            let started = Instant::now();
            match self.branch_phase(&session_id, &root_id, task) {
                Ok(branch) => {
                    result.branch = branch;
                    result.phases.push(phase_ok(Phase::Branch, started));
                }
                Err(err) => {
                    if !self.fail_phase(Phase::Branch, started, err, &mut result, &root_id) {
                        self.finish(&root_id, &session_id);
                        return result;
                    }
                }
            }
        }

        // ---- Execute ----
        {
            let started = Instant::now();
            match self
                .phase_with_timeout(self.execute_phase(&root_id, &session_id, &plan_text))
                .await
            {
                Ok(()) => result.phases.push(phase_ok(Phase::Execute, started)),
                Err(err) => {
                    if !self.fail_phase(Phase::Execute, started, err, &mut result, &root_id) {
                        self.finish(&root_id, &session_id);
                        return result;
                    }
                }
            }
        }

        // ---- Validate ----
        if let Some(test_command) = self.config.test_command.clone() {
            let started = Instant::now();
            match self.validate_phase(&session_id, &root_id, &test_command) {
                Ok(()) => result.phases.push(phase_ok(Phase::Validate, started)),
                Err(err) => {
                    if !self.fail_phase(Phase::Validate, started, err, &mut result, &root_id) {
                        self.finish(&root_id, &session_id);
                        return result;
                    }
                }
            }
        }

        // ---- Review ----
        if mode == RunMode::Full {
            let started = Instant::now();
            match self
                .phase_with_timeout(self.review_phase(&root_id, &session_id, task))
                .await
            {
                Ok(issues) => {
                    result.review_issues = issues;
                    result.phases.push(phase_ok(Phase::Review, started));
                }
                Err(err) => {
                    // Review failures never sink the run.
                    result.errors.push(format!("review: {}", err));
                    result.phases.push(phase_err(Phase::Review, started, &err));
                    if result.status == RunStatus::Success {
                        result.status = RunStatus::Partial;
                    }
                }
            }
        }

        // ---- Commit ----
        if mode == RunMode::Full && self.config.commit {
            let started = Instant::now();
            match self.commit_phase(&session_id, &root_id, task, &result.review_issues) {
                Ok(()) => result.phases.push(phase_ok(Phase::Commit, started)),
                Err(err) => {
                    if !self.fail_phase(Phase::Commit, started, err, &mut result, &root_id) {
                        self.finish(&root_id, &session_id);
                        return result;
                    }
                }
            }
        }

        self.finish(&root_id, &session_id);
        info!(status = ?result.status, "run finished");
        result
    }

    /// Close out a run on every terminal path. A root that already went
    /// to error (or was killed) keeps that status; only a live root flips
    /// to completed. The session row always gets its end timestamp.
    fn finish(&self, root_id: &str, session_id: &str) {
        if let Some(beat) = self.lifecycle.agent(root_id) {
            if beat.status.counts_as_live() {
                self.lifecycle.mark_completed(root_id);
            }
        }
        let store = self.store.lock().unwrap();
        let _ = store.close_session(session_id);
    }

    /// Record a failed phase. Returns whether the run should continue.
    fn fail_phase(
        &self,
        phase: Phase,
        started: Instant,
        error: String,
        result: &mut RunResult,
        root_id: &str,
    ) -> bool {
        result.errors.push(format!("{}: {}", phase.as_str(), error));
        result.phases.push(phase_err(phase, started, &error));
        if self.config.tolerate_failures {
            result.status = RunStatus::Partial;
            return true;
        }
        // Kill any remaining sub-agents under the root, then stop.
        for beat in self.lifecycle.snapshot() {
            if beat.parent_id.as_deref() == Some(root_id) && !beat.status.is_terminal() {
                self.lifecycle.kill_agent(root_id, &beat.agent_id);
            }
        }
        self.lifecycle.mark_error(root_id);
        result.status = RunStatus::Failed;
        false
    }

    async fn phase_with_timeout<T>(
        &self,
        future: impl std::future::Future<Output = Result<T, String>>,
    ) -> Result<T, String> {
        let timeout = Duration::from_millis(self.config.phase_timeout_ms);
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(format!("phase timed out after {:?}", timeout)),
        }
    }

    // ==========================================
    // Phases
    // ==========================================

    async fn plan_phase(
        &self,
        root_id: &str,
        session_id: &str,
        task: &str,
    ) -> Result<Plan, String> {
        let agent_id = self.spawn_sub(root_id, "planner")?;
        let output = self
            .run_agent(&agent_id, session_id, PLANNER_PROMPT, task, &self.tools)
            .await;
        self.lifecycle.mark_completed(&agent_id);
        let output = output?;

        let json = extract_json_object(&output.final_text)
            .ok_or_else(|| "planner reply contained no JSON object".to_string())?;
        serde_json::from_value::<Plan>(json).map_err(|err| format!("plan parse: {}", err))
    }

    fn branch_phase(
        &self,
        session_id: &str,
        agent_id: &str,
        task: &str,
    ) -> Result<Option<String>, String> {
        if !self.project_root.join(".git").exists() {
            debug!("not a git repository; skipping branch");
            return Ok(None);
        }
        let branch = format!("{}{}", self.config.branch_prefix, slug(task));
        self.run_shell(session_id, agent_id, &format!("git checkout -b {}", branch))?;
        Ok(Some(branch))
    }

    async fn execute_phase(
        &self,
        root_id: &str,
        session_id: &str,
        plan_text: &str,
    ) -> Result<(), String> {
        let agent_id = self.spawn_sub(root_id, "kartru")?;
        let output = self
            .run_agent(&agent_id, session_id, KARTRU_PROMPT, plan_text, &self.tools)
            .await;
        self.lifecycle.mark_completed(&agent_id);
        let output = output?;

        if output.tool_calls > 0 && output.tool_errors == output.tool_calls {
            return Err("every tool call in the execute phase failed".to_string());
        }
        Ok(())
    }

    fn validate_phase(
        &self,
        session_id: &str,
        agent_id: &str,
        test_command: &str,
    ) -> Result<(), String> {
        let output = self.run_shell(session_id, agent_id, test_command)?;
        if output.1 {
            return Err(format!("tests failed: {}", truncate(&output.0, 400)));
        }
        Ok(())
    }

    async fn review_phase(
        &self,
        root_id: &str,
        session_id: &str,
        task: &str,
    ) -> Result<Vec<ReviewIssue>, String> {
        let agent_id = self.spawn_sub(root_id, "parikshaka")?;
        let read_only = self.tools.read_only_subset();
        let prompt = format!("Review the changes made for this task: {}", task);
        let output = self
            .run_agent(&agent_id, session_id, PARIKSHAKA_PROMPT, &prompt, &read_only)
            .await;
        self.lifecycle.mark_completed(&agent_id);
        let output = output?;

        Ok(extract_json_array(&output.final_text)
            .and_then(|value| serde_json::from_value::<Vec<ReviewIssue>>(value).ok())
            .unwrap_or_default())
    }

    fn commit_phase(
        &self,
        session_id: &str,
        agent_id: &str,
        task: &str,
        issues: &[ReviewIssue],
    ) -> Result<(), String> {
        if !self.project_root.join(".git").exists() {
            return Ok(());
        }
        let summary = if issues.is_empty() {
            "no review issues".to_string()
        } else {
            format!("{} review issues noted", issues.len())
        };
        let message = format!("{} ({})", truncate(task, 60), summary);
        self.run_shell(session_id, agent_id, "git add -A")?;
        self.run_shell(
            session_id,
            agent_id,
            &format!("git commit -m '{}'", message.replace('\'', "")),
        )?;
        Ok(())
    }

    // ==========================================
    // Sub-agent streaming loop
    // ==========================================

    fn spawn_sub(&self, parent_id: &str, purpose: &str) -> Result<String, String> {
        let check = self.lifecycle.can_spawn(parent_id);
        if !check.allowed {
            return Err(check.reason.unwrap_or_else(|| "spawn refused".to_string()));
        }
        let budget = self
            .lifecycle
            .compute_child_budget(parent_id)
            .ok_or_else(|| format!("unknown parent {}", parent_id))?;
        let depth = self
            .lifecycle
            .agent(parent_id)
            .map(|beat| beat.depth + 1)
            .unwrap_or(1);

        let agent_id = format!("{}-{}", purpose, &Uuid::new_v4().to_string()[..8]);
        self.lifecycle
            .register_agent(Heartbeat::new(
                &agent_id,
                Some(parent_id.to_string()),
                depth,
                purpose,
                budget,
            ))
            .map_err(|err| err.to_string())?;
        debug!(agent = %agent_id, parent = %parent_id, budget, "sub-agent spawned");
        Ok(agent_id)
    }

    /// One sub-agent conversation: route, stream, execute tools, persist.
    async fn run_agent(
        &self,
        agent_id: &str,
        session_id: &str,
        system_prompt: &str,
        task_prompt: &str,
        registry: &ToolRegistry,
    ) -> Result<AgentRunOutput, String> {
        let mut output = AgentRunOutput {
            final_text: String::new(),
            tool_errors: 0,
            tool_calls: 0,
        };
        let mut token_usage_total: u64 = 0;

        let mut user_turn = Turn::new(session_id, self.next_turn(session_id)?, Role::User);
        user_turn.parts.push(ContentPart::Text {
            text: task_prompt.to_string(),
        });
        self.append_turn(&user_turn)?;
        let mut messages = vec![user_turn];
        self.metacog.lock().unwrap().note_turn();

        for _step in 0..self.config.max_steps {
            if self.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }

            // Route the call. Sub-agent phases always converse, so the
            // no-llm tier rides the cheapest model.
            let (decision, outcome) = {
                let router = self.router.lock().unwrap();
                let context = extract_context(
                    &messages,
                    system_prompt,
                    registry.len(),
                    0,
                    router.config(),
                );
                let decision = router.classify(&context, &self.preference);
                let outcome = router.cascade_decision(&decision);
                (decision, outcome)
            };
            let tier = outcome.final_tier;
            let model = tier
                .model_id()
                .or_else(|| Tier::Haiku.model_id())
                .unwrap_or("claude-haiku-4-5");
            debug!(tier = tier.as_str(), escalated = outcome.escalated, "model call routed");

            // The model call itself is policy-checked (cost budget).
            let llm_action = PolicyAction::LlmCall {
                model: model.to_string(),
                estimated_cost: decision.cost_estimate,
            };
            let enforcement = {
                let mut policy = self.policy.lock().unwrap();
                policy.enforce(&llm_action, &self.policy_context(session_id, agent_id))
            };
            if !enforcement.allowed {
                return Err("model call denied by policy".to_string());
            }

            let context = Context {
                system_prompt: system_prompt.to_string(),
                messages: messages.clone(),
                tools: registry.definitions(),
            };

            // One permit per stream: request and token buckets plus the
            // concurrency gate. Held across retries of the same call.
            let estimated_tokens = (context.messages.len() as u64 + 1) * 1000;
            let _permit = self.limiter.acquire(estimated_tokens).await;

            // Transient provider faults (rate limits, timeouts, 5xx) are
            // retried with bounded backoff; anything else surfaces after
            // the first attempt.
            let context_ref = &context;
            let streamed = with_retries(
                self.config.max_retries,
                RETRY_BASE_DELAY,
                |attempt| async move {
                    if attempt > 0 {
                        debug!(attempt, "retrying model call after transient provider error");
                    }
                    self.stream_once(model, context_ref).await
                },
            )
            .await
            .map_err(|err| format!("provider error: {}", err))?;

            let StreamedTurn {
                parts,
                pending_calls,
                usage,
                stop_reason,
                cost,
            } = streamed;

            let mut assistant = Turn::new(session_id, self.next_turn(session_id)?, Role::Assistant);
            assistant.model = Some(model.to_string());
            assistant.parts = parts;
            if let Some(cost) = cost {
                self.counters.lock().unwrap().session_cost += cost;
            }
            assistant.cost = CostBreakdown {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_read_tokens: usage.cache_read_tokens.unwrap_or(0),
                cache_write_tokens: usage.cache_write_tokens.unwrap_or(0),
                cost_usd: cost.unwrap_or(0.0),
            };
            token_usage_total += usage.total();
            output.final_text = assistant.text();
            self.append_turn(&assistant)?;
            messages.push(assistant);
            self.metacog.lock().unwrap().note_turn();

            self.lifecycle.record_heartbeat(
                agent_id,
                BeatUpdate {
                    turn_count: Some(messages.len() as u64),
                    token_usage: Some(token_usage_total),
                },
            );

            // Feed back an outcome reward for the routed call.
            {
                let mut router = self.router.lock().unwrap();
                let reward = if stop_reason == StopReason::MaxTokens {
                    0.3
                } else {
                    0.9
                };
                router.record_outcome(tier, &decision.context, reward);
            }

            if pending_calls.is_empty() || stop_reason != StopReason::ToolUse {
                return Ok(output);
            }

            // The guardians see real per-turn figures: where we are in the
            // conversation, what this step cost, and how full the model's
            // context window is.
            let context_window = if tier == Tier::NoLlm {
                Tier::Haiku.context_window()
            } else {
                tier.context_window()
            };
            let metrics = TurnMetrics {
                turn_number: messages.len() as u64,
                tokens_this_turn: usage.total(),
                context_used_pct: if context_window == 0 {
                    0.0
                } else {
                    (token_usage_total as f64 / context_window as f64 * 100.0).min(100.0)
                },
            };

            // Execute the tool calls and append their results as a turn.
            let mut tool_turn = Turn::new(session_id, self.next_turn(session_id)?, Role::Tool);
            for (call_id, name, arguments) in pending_calls {
                output.tool_calls += 1;
                let (content, is_error) = self
                    .execute_tool(session_id, agent_id, &name, &arguments, registry, metrics)
                    .await;
                if is_error {
                    output.tool_errors += 1;
                }
                tool_turn.parts.push(ContentPart::ToolResult {
                    tool_use_id: call_id,
                    content,
                    is_error,
                });
            }
            self.append_turn(&tool_turn)?;
            messages.push(tool_turn);
        }

        Ok(output)
    }

    /// Consume one provider stream into content parts. A terminal `error`
    /// event is classified so retry policy can tell transient faults from
    /// permanent ones.
    async fn stream_once(
        &self,
        model: &str,
        context: &Context,
    ) -> sutradhar_providers::Result<StreamedTurn> {
        let options = StreamOptions {
            max_tokens: 8192,
            cancel: self.cancel.clone(),
        };
        let mut stream = self.provider.stream(model, context, &options);
        let mut turn = StreamedTurn {
            parts: Vec::new(),
            pending_calls: Vec::new(),
            usage: TokenUsage::default(),
            stop_reason: StopReason::EndTurn,
            cost: None,
        };

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Start { .. } => {}
                StreamEvent::Text { text } => {
                    turn.parts.push(ContentPart::Text { text });
                }
                StreamEvent::Thinking { text } => {
                    turn.parts.push(ContentPart::Thinking { text });
                }
                StreamEvent::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    turn.parts.push(ContentPart::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    });
                    turn.pending_calls.push((id, name, arguments));
                }
                StreamEvent::Usage(incremental) => turn.usage = incremental,
                StreamEvent::Done {
                    stop_reason,
                    usage,
                    cost,
                } => {
                    turn.usage = usage;
                    turn.stop_reason = stop_reason;
                    turn.cost = cost;
                }
                StreamEvent::Error { message } => {
                    return Err(sutradhar_providers::Error::from_stream_message(&message));
                }
            }
        }
        Ok(turn)
    }

    /// Policy-check, execute, and observe one tool call. Denials come back
    /// as synthetic error results, never as errors.
    async fn execute_tool(
        &self,
        session_id: &str,
        agent_id: &str,
        name: &str,
        arguments: &str,
        registry: &ToolRegistry,
        metrics: TurnMetrics,
    ) -> (String, bool) {
        let args: serde_json::Value =
            serde_json::from_str(arguments).unwrap_or(serde_json::Value::Null);
        let action = PolicyAction::from_tool_call(name, &args);

        let enforcement = {
            let mut policy = self.policy.lock().unwrap();
            policy.enforce(&action, &self.policy_context(session_id, agent_id))
        };
        if !enforcement.allowed {
            let reason = enforcement
                .verdicts
                .iter()
                .find(|v| v.status == sutradhar_types::VerdictStatus::Deny)
                .map(|v| v.reason.clone())
                .unwrap_or_else(|| "denied by policy".to_string());
            debug!(tool = name, reason = %reason, "tool call denied");
            return (format!("policy denied: {}", reason), true);
        }

        // A modify verdict may have rewritten the action; use its args.
        let effective_args = match &enforcement.modified_action {
            Some(PolicyAction::ToolCall { args, .. }) => args.clone(),
            Some(PolicyAction::FileWrite { file_path, content }) => serde_json::json!({
                "file_path": file_path,
                "content": content,
            }),
            _ => args.clone(),
        };

        let handler = match registry.get(name) {
            Some(handler) => handler,
            None => return (format!("unknown tool: {}", name), true),
        };

        {
            let mut counters = self.counters.lock().unwrap();
            match &action {
                PolicyAction::FileWrite { .. } => counters.files_modified += 1,
                PolicyAction::ShellExec { .. } => counters.commands_run += 1,
                _ => {}
            }
        }

        let tool_context = ToolContext {
            working_dir: self.project_root.clone(),
            cancel: self.cancel.clone(),
        };
        let started = Instant::now();
        let result = handler.execute(&effective_args, &tool_context);
        let duration_ms = started.elapsed().as_millis() as u64;

        let observation = ToolObservation {
            tool_name: name.to_string(),
            args: effective_args,
            output: result.content.clone(),
            duration_ms,
            turn_number: metrics.turn_number,
            tokens_this_turn: metrics.tokens_this_turn,
            context_used_pct: metrics.context_used_pct,
            is_error: result.is_error,
            error_message: result.is_error.then(|| result.content.clone()),
            user_text: None,
        };
        let findings = self.guardians.scan(&observation);
        if !findings.is_empty() {
            let store = self.store.lock().unwrap();
            for finding in &findings {
                let _ = store.insert_finding(finding);
            }
        }

        let update = self.metacog.lock().unwrap().record(&ToolOutcome {
            tool_name: name.to_string(),
            success: !result.is_error,
            latency_ms: duration_ms,
            predicted_success: None,
        });
        debug!(
            calibration = update.calibration,
            velocity = update.learning_velocity,
            top_tool = update.top_tool.as_deref().unwrap_or("-"),
            "self-model updated"
        );

        (result.content, result.is_error)
    }

    /// Policy-checked shell execution used by branch/validate/commit.
    /// Returns (output, is_error).
    fn run_shell(
        &self,
        session_id: &str,
        agent_id: &str,
        command: &str,
    ) -> Result<(String, bool), String> {
        let action = PolicyAction::ShellExec {
            command: command.to_string(),
        };
        let enforcement = {
            let mut policy = self.policy.lock().unwrap();
            policy.enforce(&action, &self.policy_context(session_id, agent_id))
        };
        if !enforcement.allowed {
            return Err(format!("'{}' denied by policy", command));
        }
        self.counters.lock().unwrap().commands_run += 1;

        let result = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.project_root)
            .output()
            .map_err(|err| format!("spawn '{}': {}", command, err))?;

        let mut text = String::from_utf8_lossy(&result.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&result.stderr));
        Ok((text, !result.status.success()))
    }

    fn policy_context(&self, session_id: &str, agent_id: &str) -> PolicyContext {
        let counters = self.counters.lock().unwrap();
        PolicyContext {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            project_root: Some(self.project_root.to_string_lossy().into_owned()),
            files_modified: counters.files_modified,
            commands_run: counters.commands_run,
            session_cost: counters.session_cost,
        }
    }

    fn next_turn(&self, session_id: &str) -> Result<u64, String> {
        let store = self.store.lock().unwrap();
        store
            .next_turn_number(session_id)
            .map_err(|err| err.to_string())
    }

    fn append_turn(&self, turn: &Turn) -> Result<(), String> {
        let mut store = self.store.lock().unwrap();
        store.append_turn(turn).map_err(|err| err.to_string())
    }
}

// ==========================================
// Helpers
// ==========================================

fn phase_ok(phase: Phase, started: Instant) -> PhaseOutcome {
    PhaseOutcome {
        phase,
        ok: true,
        duration_ms: started.elapsed().as_millis() as u64,
        error: None,
    }
}

fn phase_err(phase: Phase, started: Instant, error: &str) -> PhaseOutcome {
    PhaseOutcome {
        phase,
        ok: false,
        duration_ms: started.elapsed().as_millis() as u64,
        error: Some(error.to_string()),
    }
}

fn render_plan(task: &str, plan: &Plan) -> String {
    let mut text = format!("Task: {}\n", task);
    if !plan.complexity.is_empty() {
        text.push_str(&format!("Complexity: {}\n", plan.complexity));
    }
    if plan.requires_new_files {
        text.push_str("New files are expected.\n");
    }
    if !plan.relevant_files.is_empty() {
        text.push_str(&format!("Relevant files: {}\n", plan.relevant_files.join(", ")));
    }
    for (index, step) in plan.steps.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", index + 1, step));
    }
    text
}

/// Extract the first balanced JSON object from text, tolerating fenced
/// code blocks around it.
fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    extract_balanced(text, '{', '}')
}

fn extract_json_array(text: &str) -> Option<serde_json::Value> {
    extract_balanced(text, '[', ']')
}

fn extract_balanced(text: &str, open: char, close: char) -> Option<serde_json::Value> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + c.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn slug(text: &str) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let mut compact = String::new();
    let mut last_dash = true;
    for c in slug.chars() {
        if c == '-' {
            if !last_dash {
                compact.push('-');
            }
            last_dash = true;
        } else {
            compact.push(c);
            last_dash = false;
        }
    }
    compact.trim_matches('-').chars().take(40).collect()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.trim().to_string();
    }
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleConfig;
    use crate::tools::builtin_tools;
    use sutradhar_engine::{MetacogConfig, RouterConfig};
    use sutradhar_guard::{builtin, GuardianConfig, PolicyConfig};
    use sutradhar_providers::ScriptedProvider;
    use tempfile::TempDir;

    fn runner_with_guardians(
        provider: ScriptedProvider,
        config: OrchestratorConfig,
        guardians: GuardianConfig,
        root: &TempDir,
    ) -> TaskRunner {
        let policy_config = PolicyConfig::default();
        let mut policy = PolicyEngine::new(policy_config.enforce);
        policy.add_set(builtin::default_policy_set(&policy_config));

        TaskRunner::new(
            Arc::new(LifecycleManager::new(LifecycleConfig::default())),
            TierRouter::new(RouterConfig::default()),
            policy,
            Arc::new(GuardianPipeline::new(guardians)),
            Metacognition::new(MetacogConfig::default()),
            Arc::new(Mutex::new(Database::open_in_memory().unwrap())),
            Arc::new(provider),
            builtin_tools(),
            config,
            root.path().to_path_buf(),
        )
    }

    fn runner(provider: ScriptedProvider, config: OrchestratorConfig, root: &TempDir) -> TaskRunner {
        runner_with_guardians(provider, config, GuardianConfig::default(), root)
    }

    fn plan_reply() -> Vec<StreamEvent> {
        let plan = r#"{"steps": ["read the file", "edit it"], "complexity": "small",
            "requires_new_files": false, "relevant_files": ["src/lib.rs"]}"#;
        ScriptedProvider::text_reply("plan-1", plan)
    }

    fn tool_call_reply(name: &str, arguments: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start {
                message_id: "exec-1".to_string(),
            },
            StreamEvent::ToolCall {
                id: "t1".to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
            StreamEvent::Done {
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage {
                    input_tokens: 200,
                    output_tokens: 40,
                    cache_read_tokens: None,
                    cache_write_tokens: None,
                },
                cost: Some(0.002),
            },
        ]
    }

    fn provider_error_script(message: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start {
                message_id: "err-1".to_string(),
            },
            StreamEvent::Error {
                message: message.to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn test_transient_provider_error_is_retried() {
        let temp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            provider_error_script("HTTP 500: internal server error"),
            ScriptedProvider::text_reply("exec-1", "recovered on retry"),
        ]);
        let config = OrchestratorConfig {
            mode: RunMode::Execute,
            ..Default::default()
        };
        let runner = runner(provider, config, &temp);

        let result = runner.run("transient failure then success").await;
        assert_eq!(result.status, RunStatus::Success);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_provider_error_fails_without_retry() {
        let temp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            provider_error_script("HTTP 401: unauthorized"),
            ScriptedProvider::text_reply("exec-1", "must not be reached"),
        ]);
        let config = OrchestratorConfig {
            mode: RunMode::Execute,
            ..Default::default()
        };
        let runner = runner(provider, config, &temp);

        let result = runner.run("auth failure").await;
        // Had the auth error been retried, the second script would have
        // made the run succeed.
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.errors.iter().any(|e| e.contains("provider error")));

        // A failed run is still a terminal run: the session row closes.
        let store = runner.store.lock().unwrap();
        let session = store.get_session(&result.session_id).unwrap().unwrap();
        assert!(session.ended_ts.is_some());
    }

    #[tokio::test]
    async fn test_tool_observation_carries_turn_metrics() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("input.txt"), "payload").unwrap();

        let provider = ScriptedProvider::new(vec![
            tool_call_reply("read", r#"{"file_path": "input.txt"}"#),
            ScriptedProvider::text_reply("exec-2", "done"),
        ]);
        let config = OrchestratorConfig {
            mode: RunMode::Execute,
            ..Default::default()
        };
        // Low info threshold: the 240-token step must register as heavy.
        let guardians = GuardianConfig {
            token_info_threshold: 100,
            ..Default::default()
        };
        let runner = runner_with_guardians(provider, config, guardians, &temp);

        let result = runner.run("read the input file").await;
        assert_eq!(result.status, RunStatus::Success);

        // The performance guardian saw the real per-turn token figure and
        // persisted an informational finding.
        let store = runner.store.lock().unwrap();
        assert!(store.count_findings().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_plan_only_run() {
        let temp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![plan_reply()]);
        let config = OrchestratorConfig {
            mode: RunMode::PlanOnly,
            ..Default::default()
        };
        let runner = runner(provider, config, &temp);

        let result = runner.run("rename the parser module").await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.phases.len(), 1);
        assert_eq!(result.phases[0].phase, Phase::Plan);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_execute_run_with_tool_call() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("input.txt"), "payload").unwrap();

        let provider = ScriptedProvider::new(vec![
            tool_call_reply("read", r#"{"file_path": "input.txt"}"#),
            ScriptedProvider::text_reply("exec-2", "done reading"),
        ]);
        let config = OrchestratorConfig {
            mode: RunMode::Execute,
            ..Default::default()
        };
        let runner = runner(provider, config, &temp);

        let result = runner.run("read the input file").await;
        assert_eq!(result.status, RunStatus::Success);

        // user + assistant(tool_use) + tool results + assistant(final).
        let store = runner.store.lock().unwrap();
        let sessions = store.recent_sessions(1).unwrap();
        let turns = store.turns_for_session(&sessions[0].id).unwrap();
        assert!(turns.len() >= 4);
        assert!(turns
            .iter()
            .any(|turn| turn.tool_calls().iter().any(|c| c.name == "read")));
    }

    #[tokio::test]
    async fn test_denied_tool_call_becomes_error_result() {
        let temp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            tool_call_reply("bash", r#"{"command": "rm -rf / "}"#),
            ScriptedProvider::text_reply("exec-2", "stopped"),
        ]);
        let config = OrchestratorConfig {
            mode: RunMode::Execute,
            tolerate_failures: true,
            ..Default::default()
        };
        let runner = runner(provider, config, &temp);

        let result = runner.run("clean up the disk").await;
        // The denial surfaces as a synthetic tool error, not an exception;
        // the run carries on.
        assert_ne!(result.status, RunStatus::Failed);

        let store = runner.store.lock().unwrap();
        let sessions = store.recent_sessions(1).unwrap();
        let turns = store.turns_for_session(&sessions[0].id).unwrap();
        let denied = turns.iter().flat_map(|t| t.tool_calls()).any(|call| {
            call.is_error
                && call
                    .result
                    .as_deref()
                    .map(|r| r.contains("policy denied"))
                    .unwrap_or(false)
        });
        assert!(denied, "expected a policy-denied tool result");
    }

    #[tokio::test]
    async fn test_plan_parse_failure_degrades_to_execute() {
        let temp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::text_reply("plan-1", "I would rather chat than plan."),
            ScriptedProvider::text_reply("exec-1", "did the thing"),
        ]);
        let config = OrchestratorConfig {
            mode: RunMode::Full,
            ..Default::default()
        };
        let runner = runner(provider, config, &temp);

        let result = runner.run("do the thing").await;
        assert_eq!(result.status, RunStatus::Partial);
        assert!(result.errors.iter().any(|e| e.starts_with("plan:")));
        // Execute still ran.
        assert!(result
            .phases
            .iter()
            .any(|p| p.phase == Phase::Execute && p.ok));

        let failure = result.failure().unwrap();
        assert!(failure.recoverable);
        assert_eq!(failure.phase.as_deref(), Some("plan"));
    }

    #[tokio::test]
    async fn test_sub_agents_registered_and_completed() {
        let temp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![plan_reply()]);
        let config = OrchestratorConfig {
            mode: RunMode::PlanOnly,
            ..Default::default()
        };
        let runner = runner(provider, config, &temp);

        let spawned = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = spawned.clone();
        runner.lifecycle.subscribe(move |change| {
            if change.new_status == sutradhar_types::AgentStatus::Completed {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        runner.run("plan something").await;
        // Planner sub-agent and root both completed.
        assert_eq!(spawned.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_extract_json_object_from_fenced_text() {
        let text = "Here is the plan:\n```json\n{\"steps\": [\"a\"], \"complexity\": \"small\"}\n```";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["complexity"], "small");

        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("broken { \"a\": }").is_none());
    }

    #[test]
    fn test_extract_json_handles_braces_in_strings() {
        let text = r#"{"message": "use {braces} carefully"}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["message"], "use {braces} carefully");
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Fix the Parser!"), "fix-the-parser");
        assert_eq!(slug("  multiple   spaces  "), "multiple-spaces");
    }
}
