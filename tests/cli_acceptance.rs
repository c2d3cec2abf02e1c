/// Acceptance tests for the scopeline binary
///
/// Recolor tests use the fixtures in fixtures/recolor/
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn scopeline() -> Command {
    let mut cmd = Command::new(std::env!("CARGO_BIN_EXE_scopeline"));
    cmd.env_remove("SCOPELINE_CONFIG")
        .env("SCOPELINE_LOG_FORMAT", "compact");
    cmd
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures/recolor")
        .join(name)
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_config_generate_is_valid() {
    let dir = TempDir::new().unwrap();
    let output = scopeline().args(["config", "generate"]).output().unwrap();
    assert!(output.status.success());

    let path = dir.path().join("scopeline.toml");
    fs::write(&path, &output.stdout).unwrap();

    scopeline()
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration file is valid"))
        .stdout(predicate::str::contains("Palette: palettes/night.toml (watched)"));
}

#[test]
fn test_config_validate_rejects_bad_interval() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "bad.toml", "[maintenance]\ninterval = \"soon\"\n");

    scopeline()
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("maintenance.interval"));
}

#[test]
fn test_config_show_merges_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "partial.toml", "[simulate]\ntargets = 5\n");

    scopeline()
        .args(["config", "show", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Effective Configuration"))
        .stdout(predicate::str::contains("targets = 5"))
        .stdout(predicate::str::contains("interval = \"30s\""));
}

#[test]
fn test_recolor_applies_palette() {
    let output = scopeline()
        .args(["recolor", "--sprites"])
        .arg(fixture("sprites.json"))
        .arg("--palette")
        .arg(fixture("night.toml"))
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let json = stdout_json(&output);
    assert_eq!(json["palette"], "night");

    let booster = &json["sprites"][0];
    assert_eq!(booster["id"], "Booster");
    assert_eq!(booster["frames"][0]["pixels"][0], "#3040ff");
    // Per-sprite override; the id in the palette differs only in case.
    assert_eq!(booster["frames"][0]["pixels"][1], "#004000");

    let hull = &json["sprites"][1];
    assert_eq!(hull["frames"][0]["pixels"], serde_json::json!(["#3040ff", "#20202080"]));

    // One scoped entry per sprite, one processor call per frame.
    assert_eq!(json["stats"]["misses"], 2);
    assert_eq!(json["stats"]["processor_invocations"], 3);
}

#[test]
fn test_recolor_requires_palette() {
    scopeline()
        .args(["recolor", "--sprites"])
        .arg(fixture("sprites.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("No palette given"));
}

#[test]
fn test_recolor_reports_bad_frame() {
    let dir = TempDir::new().unwrap();
    let sprites = write(
        dir.path(),
        "sprites.json",
        r##"[{"id": "hull", "frames": [{"width": 2, "height": 2, "pixels": ["#ff0000"]}]}]"##,
    );

    scopeline()
        .args(["recolor", "--sprites"])
        .arg(&sprites)
        .arg("--palette")
        .arg(fixture("night.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Sprite 'hull' frame 0"));
}

#[test]
fn test_simulate_json_report() {
    let output = scopeline()
        .args([
            "simulate",
            "--workers",
            "2",
            "--targets",
            "8",
            "--rounds",
            "20",
            "--invalidate-every",
            "5",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let json = stdout_json(&output);
    assert_eq!(json["workers"], 2);
    assert_eq!(json["requests"], 160);
    assert_eq!(json["errors"], 0);
    assert_eq!(json["palette_invalidations"], 3);

    let total = &json["total"];
    let lookups = total["hits"].as_u64().unwrap() + total["misses"].as_u64().unwrap();
    assert_eq!(lookups, 160);
    assert!(total["result_hits"].as_u64().unwrap() > 0);
}

#[test]
fn test_simulate_text_report_with_config() {
    let dir = TempDir::new().unwrap();
    let config = write(
        dir.path(),
        "scopeline.toml",
        "[maintenance]\nenabled = false\n\n[simulate]\nworkers = 1\ntargets = 2\nrounds = 4\ninvalidate_every = 0\n",
    );

    scopeline()
        .args(["simulate", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Requests: 8 (0 failed)"))
        .stdout(predicate::str::contains("Maintenance: 0 runs"));
}
