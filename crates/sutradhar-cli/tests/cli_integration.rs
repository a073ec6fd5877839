use assert_cmd::Command;
use predicates::prelude::*;
use sutradhar_testing::{plan_script, script_file, text_script, TestWorld};

fn sutradhar(world: &TestWorld) -> Command {
    let mut cmd = Command::cargo_bin("sutradhar").unwrap();
    cmd.env("SUTRADHAR_PATH", world.workspace())
        .env_remove("SUTRADHAR_SCRIPT")
        .arg("--project")
        .arg(world.project());
    cmd
}

#[test]
fn test_no_args_shows_usage() {
    let mut cmd = Command::cargo_bin("sutradhar").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_plan_with_scripted_provider_succeeds() {
    let world = TestWorld::new().unwrap();
    let script = script_file(
        world.workspace(),
        &[plan_script(&["inspect the module", "refactor it"])],
    )
    .unwrap();

    sutradhar(&world)
        .env("SUTRADHAR_SCRIPT", &script)
        .args(["plan", "refactor the parser"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"));
}

#[test]
fn test_run_degrades_but_exits_recoverable_on_unparseable_plan() {
    let world = TestWorld::new().unwrap();
    let script = script_file(
        world.workspace(),
        &[
            text_script("plan", "no structure here"),
            text_script("exec", "did it anyway"),
        ],
    )
    .unwrap();

    sutradhar(&world)
        .env("SUTRADHAR_SCRIPT", &script)
        .args(["run", "do a small task"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("execute"));
}

#[test]
fn test_consolidate_empty_store_succeeds() {
    let world = TestWorld::new().unwrap();
    sutradhar(&world)
        .arg("consolidate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Consolidation complete"));
}

#[test]
fn test_consolidate_reports_seeded_patterns() {
    let world = TestWorld::new().unwrap();
    for index in 0..5 {
        world
            .seed_tool_sequence_session(
                &format!("s{}", index),
                "project",
                &[
                    (
                        "read",
                        serde_json::json!({"file_path": format!("src/f{}.rs", index)}),
                    ),
                    (
                        "edit",
                        serde_json::json!({"file_path": format!("src/f{}.rs", index)}),
                    ),
                    ("bash", serde_json::json!({"command": "cargo test"})),
                ],
            )
            .unwrap();
    }

    sutradhar(&world)
        .arg("consolidate")
        .assert()
        .success()
        .stdout(predicate::str::contains("sessions scanned: 5"))
        .stdout(predicate::str::contains("procedures mined: 1"));
}

#[test]
fn test_review_without_scripts_is_quiet_success() {
    let world = TestWorld::new().unwrap();
    sutradhar(&world)
        .args(["review", "HEAD"])
        .assert()
        .success();
}
