use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn pathweaver_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("pathweaver");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_dir = tmp.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_path = config_dir.join("pathweaver.toml");
    fs::write(
        &config_path,
        format!(
            r#"[db]
url = "postgres://pathweaver@127.0.0.1:1/pathweaver"

[object_store]
root = "{}/objects"
"#,
            tmp.path().display()
        ),
    )
    .unwrap();
    (tmp, config_path)
}

fn run_pathweaver(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(pathweaver_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run pathweaver");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

const OWNER: &str = "6c1f3f7e-0d4b-4c5e-9a31-7b2e55c0a001";
const SET: &str = "0b7e2a7e-0d4b-4c5e-9a31-7b2e55c0a002";

#[test]
fn test_help_lists_commands() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, success) = run_pathweaver(&config, &["--help"]);
    assert!(success);
    for cmd in ["init", "stage", "compensate", "input-hash"] {
        assert!(stdout.contains(cmd), "help is missing {}: {}", cmd, stdout);
    }
    drop(tmp);
}

#[test]
fn test_unknown_stage_fails_before_connecting() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_pathweaver(&config, &["stage", "path_plan", "--owner", OWNER, "--set", SET]);
    assert!(!success);
    assert!(stderr.contains("unknown stage: path_plan"), "stderr: {}", stderr);
}

#[test]
fn test_unknown_artifact_fails() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_pathweaver(
        &config,
        &["input-hash", "--owner", OWNER, "--set", SET, "--artifact", "nope"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown artifact type: nope"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("absent.toml");
    let (_, stderr, success) = run_pathweaver(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_owner_uuid_rejected() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) =
        run_pathweaver(&config, &["stage", "embed_chunks", "--owner", "not-a-uuid", "--set", SET]);
    assert!(!success);
    assert!(stderr.contains("--owner"), "stderr: {}", stderr);
}
