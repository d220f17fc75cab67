use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("pipewright").unwrap()
}

#[test]
fn feature_create_then_list_shows_pending() {
    let dir = tempfile::tempdir().unwrap();

    cli()
        .args(["-p", dir.path().to_str().unwrap(), "feature", "create", "-d", "A"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created FEAT-001"));

    cli()
        .args(["-p", dir.path().to_str().unwrap(), "feature", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FEAT-001"))
        .stdout(predicate::str::contains("pending"));
}

#[test]
fn feature_create_with_openspec_reference_does_not_collide() {
    // --openspec sets openspec_reference (a free-text path), not
    // openspec_change_id — two creates with the same --openspec value must
    // not collide against the (openspec_change_id, openspec_task_group)
    // partial unique index, since openspec_change_id stays empty here.
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    cli()
        .args(["-p", root, "feature", "create", "-d", "A", "--openspec", "openspec/changes/add-auth"])
        .assert()
        .success();
    cli()
        .args(["-p", root, "feature", "create", "-d", "B", "--openspec", "openspec/changes/add-auth"])
        .assert()
        .success();

    cli()
        .args(["-p", root, "feature", "get", "FEAT-001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"openspec_reference\": \"openspec/changes/add-auth\""))
        .stdout(predicate::str::contains("\"openspec_change_id\": \"\""));
}

#[test]
fn scenario_scheduler_prefers_unblocked_dependency_root() {
    // Scenario 1/2 from the end-to-end table: create A then B depending on A;
    // guided names A first, then B once A is complete.
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    cli()
        .args(["-p", root, "feature", "create", "-d", "A"])
        .assert()
        .success();
    cli()
        .args(["-p", root, "feature", "create", "-d", "B", "--depends", "FEAT-001"])
        .assert()
        .success();

    cli()
        .args(["-p", root, "guided"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FEAT-001"));

    cli()
        .args(["-p", root, "feature", "update", "FEAT-001", "--status", "complete"])
        .assert()
        .success();

    cli()
        .args(["-p", root, "guided"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FEAT-002"));
}

#[test]
fn scenario_pr_open_with_safe_mode_is_left_untouched() {
    // Scenario 4: a pr-open feature under safe_mode is escalated, not merged,
    // and autoplay still reports the escalation via a non-zero exit.
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    std::process::Command::new("git").args(["init"]).current_dir(dir.path()).output().unwrap();

    cli()
        .args(["-p", root, "feature", "create", "-d", "A"])
        .assert()
        .success();
    cli()
        .args(["-p", root, "feature", "update", "FEAT-001", "--status", "pr-open"])
        .assert()
        .success();

    cli()
        .args(["-p", root, "autoplay"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("escalated"));

    cli()
        .args(["-p", root, "feature", "get", "FEAT-001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pr-open\""));
}

#[test]
fn feature_export_then_import_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    cli()
        .args(["-p", root, "feature", "create", "-d", "A"])
        .assert()
        .success();

    let out_path = dir.path().join("manifest.json");
    cli()
        .args(["-p", root, "feature", "export", "-o", out_path.to_str().unwrap()])
        .assert()
        .success();

    let dir2 = tempfile::tempdir().unwrap();
    let root2 = dir2.path().to_str().unwrap();
    cli()
        .args(["-p", root2, "feature", "import", "-i", out_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 1"));

    cli()
        .args(["-p", root2, "feature", "get", "FEAT-001"])
        .assert()
        .success();
}

#[test]
fn config_set_then_get_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    cli()
        .args(["-p", root, "config", "set", "max_retries", "5"])
        .assert()
        .success();
    cli()
        .args(["-p", root, "config", "get", "max_retries"])
        .assert()
        .success()
        .stdout(predicate::str::contains("5"));
}
