use crate::args::{Cli, Command};
use crate::output;
use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use sutradhar_engine::{MetacogSnapshot, Metacognition, TierRouter};
use sutradhar_guard::{builtin, GuardianPipeline, PolicyEngine};
use sutradhar_providers::{ModelProvider, ScriptedProvider};
use sutradhar_runtime::{
    builtin_tools, resolve_workspace_path, DreamCycle, LifecycleManager, RunMode, RunResult,
    RunStatus, RuntimeConfig, TaskRunner,
};
use sutradhar_store::{Database, JsonlAuditLogger};
use sutradhar_types::{AuditEntry, StreamEvent};

/// Exit codes: 0 success, 1 recoverable, 2 unrecoverable.
pub fn dispatch(cli: Cli) -> Result<i32> {
    let workspace = resolve_workspace_path(
        cli.workspace
            .as_ref()
            .and_then(|p| p.to_str()),
    )
    .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace: {}", workspace.display()))?;

    let project_root = cli
        .project
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = RuntimeConfig::load_from(&workspace.join("config.toml"))
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    if let Some(timeout) = cli.timeout {
        config.orchestrator.phase_timeout_ms = timeout * 1000;
    }

    let store = Arc::new(Mutex::new(
        Database::open(&workspace.join("agent.db"))
            .context("Failed to open the session store")?,
    ));

    match cli.command {
        Command::Run {
            task,
            branch,
            commit,
            tolerate_failures,
            test_command,
        } => {
            config.orchestrator.mode = RunMode::Full;
            config.orchestrator.create_branch = branch;
            config.orchestrator.commit = commit;
            config.orchestrator.tolerate_failures = tolerate_failures;
            if test_command.is_some() {
                config.orchestrator.test_command = test_command;
            }
            let result = run_task(&config, store, &workspace, project_root, &task, false)?;
            print_result(&result);
            Ok(exit_code(&result))
        }
        Command::Plan { task } => {
            config.orchestrator.mode = RunMode::PlanOnly;
            let result = run_task(&config, store, &workspace, project_root, &task, false)?;
            print_result(&result);
            Ok(exit_code(&result))
        }
        Command::Review { reference } => {
            config.orchestrator.mode = RunMode::Execute;
            let target = reference.unwrap_or_else(|| "the working tree".to_string());
            let task = format!("Review the changes in {}", target);
            let result = run_task(&config, store, &workspace, project_root, &task, true)?;
            print_result(&result);
            Ok(exit_code(&result))
        }
        Command::Consolidate => {
            let project = project_root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string());
            let cycle = DreamCycle::new(config.consolidator.clone(), store, project);
            if !cycle.try_begin_dream() {
                output::warning("a dream cycle is already running");
                return Ok(1);
            }
            let report = cycle.run_cycle()?;
            output::heading("Consolidation complete");
            output::detail(&format!("sessions scanned: {}", report.sessions_scanned));
            output::detail(&format!("patterns found: {}", report.patterns_found));
            output::detail(&format!("tendencies crystallized: {}", report.crystallized));
            output::detail(&format!("procedures mined: {}", report.procedures_mined));
            output::detail(&format!("tendencies pruned: {}", report.vasanas_deleted));
            Ok(0)
        }
    }
}

/// Build the provider. `SUTRADHAR_SCRIPT` may point at a JSON file of
/// pre-recorded event scripts (an array of event arrays) for offline and
/// test runs; without it, streams end immediately.
fn build_provider() -> Result<Arc<dyn ModelProvider>> {
    if let Ok(path) = std::env::var("SUTRADHAR_SCRIPT") {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read script file: {}", path))?;
        let scripts: Vec<Vec<StreamEvent>> =
            serde_json::from_str(&content).context("Malformed script file")?;
        return Ok(Arc::new(ScriptedProvider::new(scripts)));
    }
    Ok(Arc::new(ScriptedProvider::empty()))
}

fn run_task(
    config: &RuntimeConfig,
    store: Arc<Mutex<Database>>,
    workspace: &PathBuf,
    project_root: PathBuf,
    task: &str,
    read_only: bool,
) -> Result<RunResult> {
    let provider = build_provider()?;

    let audit = JsonlAuditLogger::under_home(workspace);
    struct Sink(JsonlAuditLogger);
    impl sutradhar_guard::AuditSink for Sink {
        fn append(&self, entry: &AuditEntry) {
            if let Err(err) = self.0.append(entry) {
                tracing::warn!(error = %err, "audit append failed");
            }
        }
    }

    let mut policy = PolicyEngine::new(config.policy.enforce).with_sink(Box::new(Sink(audit)));
    policy.add_set(builtin::default_policy_set(&config.policy));

    let tools = if read_only {
        builtin_tools().read_only_subset()
    } else {
        builtin_tools()
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;

    let lifecycle = Arc::new(LifecycleManager::new(config.lifecycle.clone()));
    {
        // The monitor task needs a runtime context to spawn into.
        let _guard = runtime.enter();
        lifecycle.start_monitoring();
    }

    // Learned state survives across sessions.
    let router_path = workspace.join("router.json");
    let router = std::fs::read_to_string(&router_path)
        .ok()
        .and_then(|json| TierRouter::deserialize(config.router.clone(), &json).ok())
        .unwrap_or_else(|| TierRouter::new(config.router.clone()));

    let metacog_path = workspace.join("metacog.json");
    let metacog = std::fs::read_to_string(&metacog_path)
        .ok()
        .and_then(|json| serde_json::from_str::<MetacogSnapshot>(&json).ok())
        .map(|snapshot| Metacognition::from_snapshot(config.metacognition.clone(), snapshot))
        .unwrap_or_else(|| Metacognition::new(config.metacognition.clone()));

    let runner = TaskRunner::new(
        lifecycle.clone(),
        router,
        policy,
        Arc::new(GuardianPipeline::new(config.guardians.clone())),
        metacog,
        store,
        provider,
        tools,
        config.orchestrator.clone(),
        project_root,
    )
    .with_rate_limits(config.provider_limits);

    let cancel = runner.cancel_token();
    let _ = ctrlc::set_handler(move || cancel.cancel());

    let result = runtime.block_on(runner.run(task));
    lifecycle.stop_monitoring();
    lifecycle.dispose();

    if let Ok(json) = runner.export_router() {
        let _ = std::fs::write(&router_path, json);
    }
    if let Ok(json) = runner.export_metacog() {
        let _ = std::fs::write(&metacog_path, json);
    }
    Ok(result)
}

fn print_result(result: &RunResult) {
    output::heading(&format!("session {}", result.session_id));
    for phase in &result.phases {
        if phase.ok {
            output::success(&format!("{} ({} ms)", phase.phase.as_str(), phase.duration_ms));
        } else {
            output::warning(&format!(
                "{} failed: {}",
                phase.phase.as_str(),
                phase.error.as_deref().unwrap_or("unknown")
            ));
        }
    }
    for issue in &result.review_issues {
        output::detail(&format!(
            "[{}] {}: {}",
            issue.severity, issue.file, issue.message
        ));
    }
    if let Some(branch) = &result.branch {
        output::detail(&format!("branch: {}", branch));
    }
    match result.status {
        RunStatus::Success => output::success("run complete"),
        RunStatus::Partial => output::warning("run completed with errors"),
        RunStatus::Failed | RunStatus::Aborted => {
            if let Some(failure) = result.failure() {
                output::error(&format!(
                    "{}{}: {} (recoverable: {})",
                    failure.code,
                    failure
                        .phase
                        .as_ref()
                        .map(|p| format!(" in {}", p))
                        .unwrap_or_default(),
                    failure.message,
                    failure.recoverable
                ));
            }
        }
    }
}

fn exit_code(result: &RunResult) -> i32 {
    match result.status {
        RunStatus::Success => 0,
        RunStatus::Partial | RunStatus::Failed => 1,
        RunStatus::Aborted => 2,
    }
}
